use prometheus::{Encoder, Registry, TextEncoder};

/// Renders a registry in the Prometheus text exposition format.
pub fn render_text(registry: &Registry) -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
