//! Idempotency keys for mutations.

use std::collections::BTreeMap;

use super::request::Method;

pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";
pub const DEFAULT_PREFIX: &str = "api";

/// Attach `X-Idempotency-Key: {prefix}:{key}` to a mutation unless the
/// caller already set one (in any letter case). GETs are left alone.
///
/// `key` defaults to a fresh UUID; pass a stable key when deliberately
/// retrying the same logical operation.
pub fn provision(
  headers: &mut BTreeMap<String, String>,
  method: Method,
  key: Option<&str>,
  prefix: &str,
) {
  if !method.is_mutation() {
    return;
  }
  let present = headers
    .keys()
    .any(|name| name.eq_ignore_ascii_case(IDEMPOTENCY_HEADER));
  if present {
    return;
  }
  let key = key
    .map(String::from)
    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
  headers.insert(IDEMPOTENCY_HEADER.to_string(), format!("{}:{}", prefix, key));
}
