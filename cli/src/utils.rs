/// Longest payload prefix printed in full.
const MAX_HEX_BYTES: usize = 64;

/// Render a payload as `<len>B <hex>`, truncating long payloads.
pub fn format_payload(bytes: &[u8]) -> String {
    if bytes.len() > MAX_HEX_BYTES {
        format!(
            "{}B {}... (+{} bytes)",
            bytes.len(),
            hex::encode(&bytes[..MAX_HEX_BYTES]),
            bytes.len() - MAX_HEX_BYTES
        )
    } else {
        format!("{}B {}", bytes.len(), hex::encode(bytes))
    }
}
