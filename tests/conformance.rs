//! Behaviour every backend must share, run once per backend.

use std::sync::Arc;
use tempfile::TempDir;

use polystore::{Capabilities, FileStore, FileStoreConfig, MemoryStore, StoreConfig};

trait Backend: polystore::DataStore + polystore::EventStore + polystore::MessageBusStore + 'static {}
impl<S: polystore::DataStore + polystore::EventStore + polystore::MessageBusStore + 'static> Backend for S {}

struct Fixture<S> {
    store: Arc<S>,
    _dir: Option<TempDir>,
}

async fn memory(capabilities: Capabilities) -> Fixture<MemoryStore> {
    let config = StoreConfig {
        capabilities,
        ..StoreConfig::default()
    };
    Fixture {
        store: Arc::new(MemoryStore::new(config)),
        _dir: None,
    }
}

async fn file(capabilities: Capabilities) -> Fixture<FileStore> {
    let dir = TempDir::new().unwrap();
    let store = FileStore::open(FileStoreConfig::new(dir.path()).with_capabilities(capabilities))
        .await
        .unwrap();
    Fixture {
        store: Arc::new(store),
        _dir: Some(dir),
    }
}

macro_rules! conformance_tests {
    ($backend:ident: $($scenario:ident),* $(,)?) => {
        mod $backend {
            $(
                #[tokio::test]
                async fn $scenario() {
                    let fixture = super::$backend(super::Capabilities::testing()).await;
                    super::scenarios::$scenario(&fixture.store).await;
                }
            )*

            #[tokio::test]
            async fn test_destructive_operations_refused_by_default() {
                let fixture = super::$backend(super::Capabilities::default()).await;
                super::scenarios::destructive_operations_refused(&fixture.store).await;
            }
        }
    };
}

macro_rules! for_each_backend {
    ($($scenario:ident),* $(,)?) => {
        conformance_tests!(memory: $($scenario),*);
        conformance_tests!(file: $($scenario),*);
    };
}

for_each_backend!(
    test_query_by_string_equality,
    test_where_all_and_empty_results,
    test_comparison_operators,
    test_like_matching,
    test_quotes_compare_exactly,
    test_date_times_compare_by_instant,
    test_optional_null_and_absent,
    test_inner_and_left_joins,
    test_projection_zeroes_unselected_fields,
    test_join_value_wins_name_clash,
    test_default_and_explicit_ordering,
    test_paging,
    test_round_trip_all_kinds,
    test_replace_is_full_overwrite,
    test_query_sees_replaced_defaults,
    test_non_finite_double_is_refused,
    test_remove_and_count,
    test_duplicate_add,
    test_invalid_arguments,
    test_destroy_all,
    test_event_append_law,
    test_stream_reset_and_destroy,
    test_message_at_least_once,
    test_rule_violation_keeps_message,
    test_subscription_independence,
    test_subscribe_is_idempotent,
    test_cancellation_leaves_state_untouched,
    test_aggregate_repository,
);

mod scenarios {
    use super::Backend;
    use chrono::{DateTime, FixedOffset, Local, TimeZone, Utc};
    use polystore::entity::ValueObject;
    use polystore::event_sourcing::Aggregate;
    use polystore::query::ConditionOperator::*;
    use polystore::utils::RetryConfig;
    use polystore::{
        handler, AggregateRepository, ConcurrencyError, DomainEvent, EntityMetadata, EventEnvelope,
        HandlerError, Optional, OrderDirection, PropertyBag, Query, StoreError, StoreResult, Value,
        ValueKind,
    };
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    fn ids(rows: &[PropertyBag]) -> Vec<&str> {
        rows.iter().map(|r| r.id.as_str()).collect()
    }

    async fn seed<S: Backend>(store: &Arc<S>, container: &str, bags: Vec<PropertyBag>) {
        for bag in bags {
            store.add(container, bag, &cancel()).await.unwrap();
            // Distinct persist times keep the default order observable.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn query<S: Backend>(store: &Arc<S>, container: &str, query: Query) -> Vec<PropertyBag> {
        store
            .query(container, &query, &EntityMetadata::new(), &cancel())
            .await
            .unwrap()
    }

    fn envelopes(versions: std::ops::RangeInclusive<u64>) -> Vec<EventEnvelope> {
        versions
            .map(|v| EventEnvelope::new(v, "Changed", format!("{{\"n\":{}}}", v), "tests.Changed"))
            .collect()
    }

    // ========================================================================
    // Query
    // ========================================================================

    pub async fn test_query_by_string_equality<S: Backend>(store: &Arc<S>) {
        seed(
            store,
            "things",
            vec![
                PropertyBag::with_id("t1").with("AStringValue", "avalue1").with("AIntValue", 1),
                PropertyBag::with_id("t2").with("AStringValue", "avalue2").with("AIntValue", 2),
            ],
        )
        .await;

        let rows = query(store, "things", Query::new().where_eq("AStringValue", "avalue2")).await;
        assert_eq!(ids(&rows), vec!["t2"]);
        assert_eq!(rows[0].get("AIntValue"), Some(&Value::Int32(2)));

        let rows = query(store, "things", Query::new().where_eq("AStringValue", "avalue3")).await;
        assert!(rows.is_empty());

        let rows = query(store, "things", Query::new().where_eq("Id", "t1")).await;
        assert_eq!(ids(&rows), vec!["t1"]);
    }

    pub async fn test_where_all_and_empty_results<S: Backend>(store: &Arc<S>) {
        assert!(query(store, "nothing", Query::where_all()).await.is_empty());

        seed(
            store,
            "things",
            (1..=4).map(|i| PropertyBag::with_id(format!("t{}", i)).with("N", i)).collect(),
        )
        .await;

        assert_eq!(query(store, "things", Query::where_all()).await.len(), 4);
        assert!(query(store, "things", Query::new().where_eq("N", 99)).await.is_empty());
    }

    pub async fn test_comparison_operators<S: Backend>(store: &Arc<S>) {
        seed(
            store,
            "numbers",
            vec![
                PropertyBag::with_id("a").with("N", 1).with("D", 1.5),
                PropertyBag::with_id("b").with("N", 2i64).with("D", 2.5),
                PropertyBag::with_id("c").with("N", 3).with("D", 3.5),
                PropertyBag::with_id("d"),
            ],
        )
        .await;

        let run = |op, value: Value| query(store, "numbers", Query::new().where_field("N", op, value));
        assert_eq!(ids(&run(EqualTo, Value::Int64(2)).await), vec!["b"]);
        assert_eq!(ids(&run(NotEqualTo, Value::Int32(2)).await), vec!["a", "c", "d"]);
        assert_eq!(ids(&run(GreaterThan, Value::Int32(1)).await), vec!["b", "c"]);
        assert_eq!(ids(&run(GreaterThanOrEqualTo, Value::Int32(2)).await), vec!["b", "c"]);
        assert_eq!(ids(&run(LessThan, Value::Int32(3)).await), vec!["a", "b"]);
        assert_eq!(ids(&run(LessThanOrEqualTo, Value::Double(2.0)).await), vec!["a", "b"]);

        let rows = query(store, "numbers", Query::new().where_field("D", GreaterThan, 2.0).where_field("N", LessThan, 3)).await;
        assert_eq!(ids(&rows), vec!["b"]);
    }

    pub async fn test_like_matching<S: Backend>(store: &Arc<S>) {
        seed(
            store,
            "words",
            vec![
                PropertyBag::with_id("w1").with("Text", "normal"),
                PropertyBag::with_id("w2").with("Text", "100%al"),
                PropertyBag::with_id("w3").with("Text", "NORMAL"),
                PropertyBag::with_id("w4").with("Text", "other"),
            ],
        )
        .await;

        let like = |pattern: &str| query(store, "words", Query::new().where_field("Text", Like, pattern));
        assert_eq!(ids(&like("rma").await), vec!["w1"]);
        assert_eq!(ids(&like("%al").await), vec!["w1", "w2"]);
        assert_eq!(ids(&like("0%al").await), vec!["w2"]);
        assert_eq!(ids(&like("n%l").await), vec!["w1"]);
        assert!(like("xyz").await.is_empty());
    }

    pub async fn test_quotes_compare_exactly<S: Backend>(store: &Arc<S>) {
        seed(
            store,
            "names",
            vec![
                PropertyBag::with_id("n1").with("Name", "O'Brien"),
                PropertyBag::with_id("n2").with("Name", "O''Brien"),
            ],
        )
        .await;

        assert_eq!(ids(&query(store, "names", Query::new().where_eq("Name", "O'Brien")).await), vec!["n1"]);
        assert_eq!(ids(&query(store, "names", Query::new().where_eq("Name", "O''Brien")).await), vec!["n2"]);
    }

    pub async fn test_date_times_compare_by_instant<S: Backend>(store: &Arc<S>) {
        let instant = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let plus_two: DateTime<FixedOffset> = instant.with_timezone(&FixedOffset::east_opt(2 * 3600).unwrap());
        let minus_five: DateTime<FixedOffset> = instant.with_timezone(&FixedOffset::west_opt(5 * 3600).unwrap());

        seed(
            store,
            "stamps",
            vec![
                PropertyBag::with_id("s1").with("At", instant).with("AtOffset", plus_two),
                PropertyBag::with_id("s2")
                    .with("At", instant + chrono::Duration::hours(1))
                    .with("AtOffset", plus_two + chrono::Duration::hours(1)),
            ],
        )
        .await;

        let rows = query(store, "stamps", Query::new().where_eq("AtOffset", minus_five)).await;
        assert_eq!(ids(&rows), vec!["s1"]);
        let rows = query(store, "stamps", Query::new().where_eq("At", plus_two)).await;
        assert_eq!(ids(&rows), vec!["s1"]);
        let rows = query(store, "stamps", Query::new().where_field("At", GreaterThan, minus_five)).await;
        assert_eq!(ids(&rows), vec!["s2"]);
    }

    pub async fn test_optional_null_and_absent<S: Backend>(store: &Arc<S>) {
        let mut absent = PropertyBag::with_id("absent");
        absent.set_optional("Maybe", Optional::<i32>::Absent);
        let mut null = PropertyBag::with_id("null");
        null.set_optional("Maybe", Optional::<i32>::Null);
        let mut value = PropertyBag::with_id("value");
        value.set_optional("Maybe", Optional::Value(7));
        seed(store, "optionals", vec![absent, null, value]).await;

        let rows = query(store, "optionals", Query::new().where_eq("Maybe", Value::Null)).await;
        assert_eq!(ids(&rows), vec!["absent", "null"]);
        let rows = query(store, "optionals", Query::new().where_field("Maybe", NotEqualTo, Value::Null)).await;
        assert_eq!(ids(&rows), vec!["value"]);

        let metadata = EntityMetadata::new().optional("Maybe", ValueKind::Int32);
        let read = |id: &'static str| {
            let metadata = metadata.clone();
            async move { store.retrieve("optionals", id, &metadata, &cancel()).await.unwrap().unwrap() }
        };
        assert!(read("absent").await.get_optional("Maybe").is_absent());
        assert!(read("null").await.get_optional("Maybe").is_null());
        assert_eq!(read("value").await.get_optional("Maybe"), Optional::Value(&Value::Int32(7)));
    }

    async fn seed_orders<S: Backend>(store: &Arc<S>) {
        seed(
            store,
            "customers",
            vec![
                PropertyBag::with_id("c1").with("Name", "Ana"),
                PropertyBag::with_id("c2").with("Name", "Bo"),
            ],
        )
        .await;
        seed(
            store,
            "orders",
            vec![
                PropertyBag::with_id("o1").with("CustomerId", "c1").with("Total", 10),
                PropertyBag::with_id("o2").with("CustomerId", "c2").with("Total", 20),
                PropertyBag::with_id("o3").with("CustomerId", "missing").with("Total", 30),
            ],
        )
        .await;
    }

    pub async fn test_inner_and_left_joins<S: Backend>(store: &Arc<S>) {
        seed_orders(store).await;
        let metadata = EntityMetadata::new().property("CustomerName", ValueKind::String);

        let inner = Query::new()
            .inner_join("customers", "CustomerId", "Id")
            .select_from_join("customers", "Name", "CustomerName");
        let rows = store.query("orders", &inner, &metadata, &cancel()).await.unwrap();
        assert_eq!(ids(&rows), vec!["o1", "o2"]);
        assert_eq!(rows[0].get("CustomerName").and_then(Value::as_text), Some("Ana"));
        assert_eq!(rows[1].get("CustomerName").and_then(Value::as_text), Some("Bo"));

        let left = Query::new()
            .left_join("customers", "CustomerId", "Id")
            .select(["Total"])
            .select_from_join("customers", "Name", "CustomerName");
        let rows = store.query("orders", &left, &metadata, &cancel()).await.unwrap();
        assert_eq!(ids(&rows), vec!["o1", "o2", "o3"]);
        assert_eq!(rows[2].get("CustomerName"), Some(&ValueKind::String.zero()));
        assert_eq!(rows[2].get("Total"), Some(&Value::Int32(30)));

        let filtered = Query::new()
            .where_field("Total", GreaterThan, 10)
            .inner_join("customers", "CustomerId", "Id");
        let rows = store.query("orders", &filtered, &metadata, &cancel()).await.unwrap();
        assert_eq!(ids(&rows), vec!["o2"]);
    }

    pub async fn test_projection_zeroes_unselected_fields<S: Backend>(store: &Arc<S>) {
        seed(
            store,
            "things",
            vec![PropertyBag::with_id("t1")
                .with("Name", "kept")
                .with("Count", 5)
                .with("Flag", true)],
        )
        .await;
        let metadata = EntityMetadata::new()
            .property("Name", ValueKind::String)
            .property("Count", ValueKind::Int32)
            .property("Flag", ValueKind::Boolean);

        let rows = store
            .query("things", &Query::new().select(["Name"]), &metadata, &cancel())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "t1");
        assert_eq!(rows[0].get("Name").and_then(Value::as_text), Some("kept"));
        assert_eq!(rows[0].get("Count"), Some(&Value::Int32(0)));
        assert_eq!(rows[0].get("Flag"), Some(&Value::Boolean(false)));
    }

    pub async fn test_join_value_wins_name_clash<S: Backend>(store: &Arc<S>) {
        seed_orders(store).await;
        let query = Query::new()
            .inner_join("customers", "CustomerId", "Id")
            .select(["CustomerId"])
            .select_from_join("customers", "Name", "CustomerId");

        let rows = store
            .query("orders", &query, &EntityMetadata::new(), &cancel())
            .await
            .unwrap();
        assert_eq!(rows[0].get("CustomerId").and_then(Value::as_text), Some("Ana"));
    }

    pub async fn test_default_and_explicit_ordering<S: Backend>(store: &Arc<S>) {
        seed(
            store,
            "things",
            vec![
                PropertyBag::with_id("e1").with("K", 1),
                PropertyBag::with_id("e2").with("K", 1),
                PropertyBag::with_id("e3").with("K", 0),
            ],
        )
        .await;

        assert_eq!(ids(&query(store, "things", Query::where_all()).await), vec!["e1", "e2", "e3"]);

        let ascending = query(store, "things", Query::new().order_by("K", OrderDirection::Ascending)).await;
        assert_eq!(ids(&ascending), vec!["e3", "e1", "e2"]);
        let descending = query(store, "things", Query::new().order_by("K", OrderDirection::Descending)).await;
        assert_eq!(ids(&descending)[0], "e1");
        assert_eq!(ids(&descending)[2], "e3");

        store
            .replace("things", "e1", PropertyBag::with_id("e1").with("K", 1), &cancel())
            .await
            .unwrap();
        assert_eq!(ids(&query(store, "things", Query::where_all()).await), vec!["e2", "e3", "e1"]);
    }

    pub async fn test_paging<S: Backend>(store: &Arc<S>) {
        seed(
            store,
            "pages",
            (0..5).map(|i| PropertyBag::with_id(format!("p{}", i)).with("N", i)).collect(),
        )
        .await;
        let ordered = || Query::new().order_by("N", OrderDirection::Ascending);

        assert_eq!(ids(&query(store, "pages", ordered().skip(1).take(2)).await), vec!["p1", "p2"]);
        assert_eq!(ids(&query(store, "pages", ordered().skip(3).take(10)).await), vec!["p3", "p4"]);
        assert!(query(store, "pages", ordered().take(0)).await.is_empty());
        assert!(query(store, "pages", ordered().skip(5)).await.is_empty());
        for s in 0..7 {
            for t in 0..7 {
                let rows = query(store, "pages", ordered().skip(s).take(t)).await;
                assert_eq!(rows.len(), t.min(5usize.saturating_sub(s)));
            }
        }
    }

    // ========================================================================
    // Entities
    // ========================================================================

    #[derive(Debug, Clone, PartialEq)]
    struct Money {
        amount: i64,
        currency: String,
    }

    impl ValueObject for Money {
        fn dehydrate(&self) -> Vec<String> {
            vec![self.amount.to_string(), self.currency.clone()]
        }

        fn rehydrate(parts: &[String]) -> StoreResult<Self> {
            match parts {
                [amount, currency] => Ok(Money {
                    amount: amount
                        .parse()
                        .map_err(|_| StoreError::invalid_argument("bad amount"))?,
                    currency: currency.clone(),
                }),
                _ => Err(StoreError::invalid_argument("money has two parts")),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Address {
        street: String,
        number: u32,
    }

    pub async fn test_round_trip_all_kinds<S: Backend>(store: &Arc<S>) {
        let local = Local.with_ymd_and_hms(2023, 7, 14, 9, 30, 0).unwrap();
        let offset = FixedOffset::east_opt(5 * 3600 + 1800)
            .unwrap()
            .with_ymd_and_hms(2023, 7, 14, 9, 30, 0)
            .unwrap();
        let guid = Uuid::new_v4();
        let address = Address {
            street: "Main".to_string(),
            number: 42,
        };

        let mut bag = PropertyBag::with_id("all")
            .with("String", "it's | here")
            .with("Boolean", true)
            .with("Int32", i32::MIN)
            .with("Int64", i64::MAX)
            .with("Double", 0.1 + 0.2)
            .with("Guid", guid)
            .with("Binary", vec![0u8, 1, 254, 255])
            .with("Local", local)
            .with("Offset", offset)
            .with("Enum", Value::enumeration("Shipped"))
            .with("Complex", Value::complex(&address).unwrap());
        bag.set_value_object(
            "Money",
            &Money {
                amount: 125,
                currency: "E|UR".to_string(),
            },
        );
        let written = store.add("kinds", bag.clone(), &cancel()).await.unwrap();
        assert!(written.last_persisted_at.is_some());

        let read = store
            .retrieve("kinds", "all", &EntityMetadata::new(), &cancel())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.properties.len(), bag.properties.len());
        for (name, value) in &bag.properties {
            assert_eq!(read.get(name), Some(value), "field {}", name);
        }
        assert_eq!(read.get("Local"), Some(&Value::DateTime(local.with_timezone(&Utc))));
        assert_eq!(read.get("Offset").and_then(Value::as_instant), Some(offset.with_timezone(&Utc)));
        assert_eq!(read.get("Binary").and_then(Value::as_bytes), Some(&[0u8, 1, 254, 255][..]));
        assert_eq!(read.get("Complex").unwrap().to_complex::<Address>().unwrap(), Some(address));
        assert_eq!(
            read.get_value_object::<Money>("Money").unwrap(),
            Some(Money {
                amount: 125,
                currency: "E|UR".to_string()
            })
        );

        assert!(store
            .retrieve("kinds", "missing", &EntityMetadata::new(), &cancel())
            .await
            .unwrap()
            .is_none());
    }

    pub async fn test_replace_is_full_overwrite<S: Backend>(store: &Arc<S>) {
        let metadata = EntityMetadata::new()
            .property("Name", ValueKind::String)
            .property("Count", ValueKind::Int64);
        let first = store
            .add("things", PropertyBag::with_id("t1").with("Name", "a").with("Count", 3i64), &cancel())
            .await
            .unwrap();

        let replaced = store
            .replace("things", "t1", PropertyBag::with_id("t1").with("Name", "b"), &cancel())
            .await
            .unwrap();
        assert!(replaced.last_persisted_at >= first.last_persisted_at);

        let read = store.retrieve("things", "t1", &metadata, &cancel()).await.unwrap().unwrap();
        assert_eq!(read.get("Name").and_then(Value::as_text), Some("b"));
        assert_eq!(read.get("Count"), Some(&Value::Int64(0)));
        assert_eq!(store.count("things", &cancel()).await.unwrap(), 1);

        let err = store
            .replace("things", "nope", PropertyBag::with_id("nope"), &cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EntityNotFound { ref id, .. } if id == "nope"));

        let err = store
            .replace("things", "t1", PropertyBag::with_id("other"), &cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    pub async fn test_query_sees_replaced_defaults<S: Backend>(store: &Arc<S>) {
        let metadata = EntityMetadata::new()
            .property("Name", ValueKind::String)
            .property("Count", ValueKind::Int64);
        seed(
            store,
            "things",
            vec![
                PropertyBag::with_id("t1").with("Name", "a").with("Count", 3i64),
                PropertyBag::with_id("t2").with("Count", 5i64),
            ],
        )
        .await;
        store
            .replace("things", "t1", PropertyBag::with_id("t1").with("Name", "a"), &cancel())
            .await
            .unwrap();

        let run = |query: Query| {
            let metadata = metadata.clone();
            async move { store.query("things", &query, &metadata, &cancel()).await.unwrap() }
        };
        let zero = run(Query::new().where_eq("Count", 0i64)).await;
        assert_eq!(ids(&zero), vec!["t1"]);
        assert_eq!(zero[0].get("Count"), Some(&Value::Int64(0)));
        assert!(run(Query::new().where_eq("Count", Value::Null)).await.is_empty());

        let ascending = run(Query::new().order_by("Count", OrderDirection::Ascending)).await;
        assert_eq!(ids(&ascending), vec!["t1", "t2"]);
        let descending = run(Query::new().order_by("Count", OrderDirection::Descending)).await;
        assert_eq!(ids(&descending), vec!["t2", "t1"]);
    }

    pub async fn test_non_finite_double_is_refused<S: Backend>(store: &Arc<S>) {
        store
            .add("numbers", PropertyBag::with_id("good").with("D", 1.5), &cancel())
            .await
            .unwrap();

        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = store
                .add("numbers", PropertyBag::with_id("bad").with("D", bad), &cancel())
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::InvalidArgument(_)));

            let err = store
                .replace("numbers", "good", PropertyBag::with_id("good").with("D", bad), &cancel())
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::InvalidArgument(_)));
        }

        // The container stays readable and unchanged.
        assert_eq!(store.count("numbers", &cancel()).await.unwrap(), 1);
        let good = store
            .retrieve("numbers", "good", &EntityMetadata::new(), &cancel())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(good.get("D"), Some(&Value::Double(1.5)));
        assert_eq!(ids(&query(store, "numbers", Query::where_all()).await), vec!["good"]);
    }

    pub async fn test_remove_and_count<S: Backend>(store: &Arc<S>) {
        assert_eq!(store.count("things", &cancel()).await.unwrap(), 0);
        seed(store, "things", vec![PropertyBag::with_id("t1"), PropertyBag::with_id("t2")]).await;
        assert_eq!(store.count("things", &cancel()).await.unwrap(), 2);

        store.remove("things", "t1", &cancel()).await.unwrap();
        store.remove("things", "t1", &cancel()).await.unwrap();
        store.remove("elsewhere", "t1", &cancel()).await.unwrap();
        assert_eq!(store.count("things", &cancel()).await.unwrap(), 1);
        assert!(store
            .retrieve("things", "t1", &EntityMetadata::new(), &cancel())
            .await
            .unwrap()
            .is_none());
    }

    pub async fn test_duplicate_add<S: Backend>(store: &Arc<S>) {
        store.add("things", PropertyBag::with_id("t1"), &cancel()).await.unwrap();
        let err = store
            .add("things", PropertyBag::with_id("t1"), &cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEntity { .. }));
        assert_eq!(store.count("things", &cancel()).await.unwrap(), 1);
    }

    pub async fn test_invalid_arguments<S: Backend>(store: &Arc<S>) {
        let invalid = |result: Result<(), StoreError>| matches!(result, Err(StoreError::InvalidArgument(_)));
        let meta = EntityMetadata::new();

        assert!(invalid(store.add("", PropertyBag::with_id("t1"), &cancel()).await.map(|_| ())));
        assert!(invalid(store.add("things", PropertyBag::with_id(""), &cancel()).await.map(|_| ())));
        assert!(invalid(store.count(" ", &cancel()).await.map(|_| ())));
        assert!(invalid(store.query("", &Query::where_all(), &meta, &cancel()).await.map(|_| ())));
        assert!(invalid(store.retrieve("things", "", &meta, &cancel()).await.map(|_| ())));
        assert!(invalid(store.remove("", "t1", &cancel()).await));
        assert!(invalid(store.get_event_stream("", "e1", &cancel()).await.map(|_| ())));
        assert!(invalid(store.add_events("c", "e1", Vec::new(), &cancel()).await));
        assert!(invalid(store.subscribe("", "sub", &cancel()).await));
        assert!(invalid(store.send("", "body", &cancel()).await));
        assert!(invalid(store.pending_count("topic", "", &cancel()).await.map(|_| ())));
    }

    pub async fn test_destroy_all<S: Backend>(store: &Arc<S>) {
        seed(store, "things", vec![PropertyBag::with_id("t1")]).await;
        store.add_events("streams", "e1", envelopes(1..=2), &cancel()).await.unwrap();
        store.subscribe("topic", "sub", &cancel()).await.unwrap();
        store.send("topic", "amessage", &cancel()).await.unwrap();

        store.destroy_all("things", &cancel()).await.unwrap();
        store.destroy_all_streams("streams", &cancel()).await.unwrap();
        store.destroy_topic("topic", &cancel()).await.unwrap();

        assert_eq!(store.count("things", &cancel()).await.unwrap(), 0);
        assert!(store.get_event_stream("streams", "e1", &cancel()).await.unwrap().is_empty());
        assert_eq!(store.pending_count("topic", "sub", &cancel()).await.unwrap(), 0);

        store.destroy_all("never-written", &cancel()).await.unwrap();
    }

    pub async fn destructive_operations_refused<S: Backend>(store: &Arc<S>) {
        store.add("things", PropertyBag::with_id("t1"), &cancel()).await.unwrap();

        let disabled = |result: Result<(), StoreError>| matches!(result, Err(StoreError::CapabilityDisabled(_)));
        assert!(disabled(store.destroy_all("things", &cancel()).await));
        assert!(disabled(store.destroy_all_streams("streams", &cancel()).await));
        assert!(disabled(store.destroy_topic("topic", &cancel()).await));
        assert_eq!(store.count("things", &cancel()).await.unwrap(), 1);
    }

    // ========================================================================
    // Event streams
    // ========================================================================

    fn conflict(result: StoreResult<()>) -> ConcurrencyError {
        match result {
            Err(StoreError::Concurrency(e)) => e,
            other => panic!("expected a concurrency error, got {:?}", other),
        }
    }

    pub async fn test_event_append_law<S: Backend>(store: &Arc<S>) {
        assert!(store.get_event_stream("accounts", "e1", &cancel()).await.unwrap().is_empty());

        store.add_events("accounts", "e1", envelopes(1..=3), &cancel()).await.unwrap();
        let err = conflict(store.add_events("accounts", "e1", envelopes(1..=1), &cancel()).await);
        assert_eq!(
            err.to_string(),
            "event stream already updated: version 1 of stream 'accounts/e1' already exists"
        );

        let err = conflict(store.add_events("accounts", "e1", envelopes(3..=4), &cancel()).await);
        assert!(matches!(err, ConcurrencyError::StreamAlreadyUpdated { version: 3, .. }));

        let err = conflict(store.add_events("accounts", "e1", envelopes(6..=7), &cancel()).await);
        assert_eq!(
            err.to_string(),
            "event stream missing updates: stream 'accounts/e1' expected version 4 but received version 6"
        );

        store.add_events("accounts", "e1", envelopes(4..=5), &cancel()).await.unwrap();
        let stream = store.get_event_stream("accounts", "e1", &cancel()).await.unwrap();
        assert_eq!(stream.iter().map(|e| e.version).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert!(stream.iter().all(|e| e.entity_id == "e1" && e.recorded_at.is_some()));
        assert_eq!(stream[3].data, "{\"n\":4}");
        assert_eq!(stream[3].metadata.schema, "tests.Changed");

        assert!(store.get_event_stream("accounts", "e2", &cancel()).await.unwrap().is_empty());
    }

    pub async fn test_stream_reset_and_destroy<S: Backend>(store: &Arc<S>) {
        let err = conflict(store.add_events("accounts", "e1", envelopes(2..=3), &cancel()).await);
        assert_eq!(
            err.to_string(),
            "event stream reset: stream 'accounts/e1' is empty but the batch starts at version 2"
        );

        store.add_events("accounts", "e1", envelopes(1..=2), &cancel()).await.unwrap();
        store.destroy_all_streams("accounts", &cancel()).await.unwrap();
        assert!(store.get_event_stream("accounts", "e1", &cancel()).await.unwrap().is_empty());
        let err = conflict(store.add_events("accounts", "e1", envelopes(3..=3), &cancel()).await);
        assert_eq!(err.kind(), "stream_reset");
    }

    // ========================================================================
    // Message bus
    // ========================================================================

    pub async fn test_message_at_least_once<S: Backend>(store: &Arc<S>) {
        store.subscribe("topic", "sub", &cancel()).await.unwrap();
        store.send("topic", "amessage", &cancel()).await.unwrap();

        let err = store
            .receive_single(
                "topic",
                "sub",
                handler(|_| async { Err(anyhow::anyhow!("handler broke").into()) }),
                &cancel(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unexpected(ref m) if m.contains("handler broke")));
        assert_eq!(store.pending_count("topic", "sub", &cancel()).await.unwrap(), 1);

        let err = store
            .receive_single("topic", "sub", handler(|_| async { panic!("handler panicked") }), &cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unexpected(_)));
        assert_eq!(store.pending_count("topic", "sub", &cancel()).await.unwrap(), 1);

        let processed = store
            .receive_single(
                "topic",
                "sub",
                handler(|message| async move {
                    if message.body == "amessage" && message.delivery_count == 3 {
                        Ok(())
                    } else {
                        Err(HandlerError::RuleViolation(format!("unexpected delivery {:?}", message)))
                    }
                }),
                &cancel(),
            )
            .await
            .unwrap();
        assert!(processed);
        assert_eq!(store.pending_count("topic", "sub", &cancel()).await.unwrap(), 0);

        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let processed = store
            .receive_single(
                "topic",
                "sub",
                handler(move |_| async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }),
                &cancel(),
            )
            .await
            .unwrap();
        assert!(!processed);
        assert!(!called.load(Ordering::SeqCst));
    }

    pub async fn test_rule_violation_keeps_message<S: Backend>(store: &Arc<S>) {
        store.subscribe("topic", "sub", &cancel()).await.unwrap();
        store.send("topic", "first", &cancel()).await.unwrap();
        store.send("topic", "second", &cancel()).await.unwrap();

        let err = store
            .receive_single(
                "topic",
                "sub",
                handler(|_| async { Err(HandlerError::RuleViolation("order is closed".to_string())) }),
                &cancel(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RuleViolation(ref m) if m == "order is closed"));

        let body = Arc::new(std::sync::Mutex::new(String::new()));
        let seen = body.clone();
        store
            .receive_single(
                "topic",
                "sub",
                handler(move |message| async move {
                    *seen.lock().unwrap() = message.body;
                    Ok(())
                }),
                &cancel(),
            )
            .await
            .unwrap();
        assert_eq!(*body.lock().unwrap(), "first");
        assert_eq!(store.pending_count("topic", "sub", &cancel()).await.unwrap(), 1);
    }

    pub async fn test_subscription_independence<S: Backend>(store: &Arc<S>) {
        store.send("topic", "before any subscription", &cancel()).await.unwrap();
        store.subscribe("topic", "one", &cancel()).await.unwrap();
        store.subscribe("topic", "two", &cancel()).await.unwrap();
        store.send("topic", "amessage", &cancel()).await.unwrap();

        for subscription in ["one", "two"] {
            assert_eq!(store.pending_count("topic", subscription, &cancel()).await.unwrap(), 1);
        }

        let processed = store
            .receive_single(
                "topic",
                "one",
                handler(|message| async move {
                    assert_eq!(message.body, "amessage");
                    Ok(())
                }),
                &cancel(),
            )
            .await
            .unwrap();
        assert!(processed);
        assert_eq!(store.pending_count("topic", "one", &cancel()).await.unwrap(), 0);
        assert_eq!(store.pending_count("topic", "two", &cancel()).await.unwrap(), 1);

        let processed = store
            .receive_single(
                "topic",
                "two",
                handler(|message| async move {
                    assert_eq!(message.body, "amessage");
                    assert_eq!(message.delivery_count, 1);
                    Ok(())
                }),
                &cancel(),
            )
            .await
            .unwrap();
        assert!(processed);
        assert_eq!(store.pending_count("other", "two", &cancel()).await.unwrap(), 0);
    }

    pub async fn test_subscribe_is_idempotent<S: Backend>(store: &Arc<S>) {
        store.subscribe("topic", "sub", &cancel()).await.unwrap();
        store.send("topic", "amessage", &cancel()).await.unwrap();
        store.subscribe("topic", "sub", &cancel()).await.unwrap();
        assert_eq!(store.pending_count("topic", "sub", &cancel()).await.unwrap(), 1);
    }

    pub async fn test_cancellation_leaves_state_untouched<S: Backend>(store: &Arc<S>) {
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        store.add("things", PropertyBag::with_id("t1"), &cancel()).await.unwrap();
        store.subscribe("topic", "sub", &cancel()).await.unwrap();

        let is_cancelled = |result: Result<(), StoreError>| matches!(result, Err(StoreError::Cancelled));
        assert!(is_cancelled(store.add("things", PropertyBag::with_id("t2"), &cancelled).await.map(|_| ())));
        assert!(is_cancelled(
            store
                .replace("things", "t1", PropertyBag::with_id("t1").with("X", 1), &cancelled)
                .await
                .map(|_| ())
        ));
        assert!(is_cancelled(store.remove("things", "t1", &cancelled).await));
        assert!(is_cancelled(store.add_events("c", "e1", envelopes(1..=1), &cancelled).await));
        assert!(is_cancelled(store.send("topic", "amessage", &cancelled).await));

        let read = store
            .retrieve("things", "t1", &EntityMetadata::new(), &cancel())
            .await
            .unwrap()
            .unwrap();
        assert!(read.properties.is_empty());
        assert_eq!(store.count("things", &cancel()).await.unwrap(), 1);
        assert!(store.get_event_stream("c", "e1", &cancel()).await.unwrap().is_empty());
        assert_eq!(store.pending_count("topic", "sub", &cancel()).await.unwrap(), 0);
    }

    // ========================================================================
    // Aggregates
    // ========================================================================

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    enum CounterEvent {
        Started,
        Incremented { by: u32 },
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> &str {
            match self {
                CounterEvent::Started => "Started",
                CounterEvent::Incremented { .. } => "Incremented",
            }
        }
    }

    enum CounterCommand {
        Start,
        Increment(u32),
    }

    #[derive(Debug, thiserror::Error)]
    #[error("counter is not started")]
    struct NotStarted;

    struct Counter {
        total: u32,
    }

    impl Aggregate for Counter {
        type Event = CounterEvent;
        type Command = CounterCommand;
        type Error = NotStarted;

        const CONTAINER: &'static str = "counters";

        fn apply_first_event(_id: &str, _event: &CounterEvent) -> Result<Self, NotStarted> {
            Ok(Counter { total: 0 })
        }

        fn apply_event(&mut self, event: &CounterEvent) -> Result<(), NotStarted> {
            if let CounterEvent::Incremented { by } = event {
                self.total += by;
            }
            Ok(())
        }

        fn handle_command(state: Option<&Self>, command: &CounterCommand) -> Result<Vec<CounterEvent>, NotStarted> {
            match (state, command) {
                (None, CounterCommand::Start) => Ok(vec![CounterEvent::Started]),
                (Some(_), CounterCommand::Start) => Ok(Vec::new()),
                (None, CounterCommand::Increment(_)) => Err(NotStarted),
                (Some(_), CounterCommand::Increment(by)) => Ok(vec![CounterEvent::Incremented { by: *by }]),
            }
        }
    }

    pub async fn test_aggregate_repository<S: Backend>(store: &Arc<S>) {
        let repository = AggregateRepository::new(store.clone(), RetryConfig::aggressive());

        let err = repository
            .execute::<Counter>("k1", &CounterCommand::Increment(1), &cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RuleViolation(_)));

        repository.execute::<Counter>("k1", &CounterCommand::Start, &cancel()).await.unwrap();
        let commands = (1..=3).map(|by| {
            let repository = &repository;
            async move {
                repository
                    .execute::<Counter>("k1", &CounterCommand::Increment(by), &cancel())
                    .await
            }
        });
        for result in futures_util::future::join_all(commands).await {
            result.unwrap();
        }

        let loaded = repository.load::<Counter>("k1", &cancel()).await.unwrap().unwrap();
        assert_eq!(loaded.version, 4);
        assert_eq!(loaded.state.total, 6);
        assert_eq!(store.get_event_stream("counters", "k1", &cancel()).await.unwrap().len(), 4);
    }
}
