use ulid::Ulid;

/// Identifier attached to each propagation run so its log lines can be correlated.
pub fn new_run_id() -> String {
    Ulid::new().to_string()
}

#[cfg(test)]
pub fn is_run_id(s: &str) -> bool {
    Ulid::from_string(s).is_ok()
}
