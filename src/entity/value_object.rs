use crate::error::{StoreError, StoreResult};

// ============================================================================
// Value Objects
// ============================================================================
//
// A value object is stored as its atomic parts joined by `|`. A literal `|`
// or `\` inside a part is escaped with a backslash.
//
// An empty part list and a single empty part share the encoding "", which
// always decodes as one empty part.
//
// ============================================================================

const DELIMITER: char = '|';
const ESCAPE: char = '\\';

pub trait ValueObject: Sized {
    /// Atomic parts in a fixed order. Returning no parts reads back as `[""]`.
    fn dehydrate(&self) -> Vec<String>;
    fn rehydrate(parts: &[String]) -> StoreResult<Self>;
}

pub fn encode<V: ValueObject>(value: &V) -> String {
    join_parts(&value.dehydrate())
}

pub fn decode<V: ValueObject>(encoded: &str) -> StoreResult<V> {
    V::rehydrate(&split_parts(encoded)?)
}

pub fn join_parts(parts: &[String]) -> String {
    let mut out = String::new();
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            out.push(DELIMITER);
        }
        for c in part.chars() {
            if c == DELIMITER || c == ESCAPE {
                out.push(ESCAPE);
            }
            out.push(c);
        }
    }
    out
}

pub fn split_parts(encoded: &str) -> StoreResult<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = encoded.chars();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => {
                    return Err(StoreError::InvalidArgument(format!(
                        "dangling escape in value object '{}'",
                        encoded
                    )))
                }
            },
            DELIMITER => parts.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    parts.push(current);
    Ok(parts)
}
