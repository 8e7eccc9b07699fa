use uuid::Uuid;

/// Generate a fresh exchange correlation id.
///
/// UUIDv4 makes ids unique for the lifetime of a tunnel connection without
/// any coordination between the tasks creating exchanges.
pub fn generate_exchange_id() -> Uuid {
    Uuid::new_v4()
}

/// Generate a backend id for an agent that did not claim one.
pub fn generate_backend_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_exchange_ids_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate_exchange_id()));
        }
    }

    #[test]
    fn test_backend_id_is_a_uuid() {
        let id = generate_backend_id();
        assert!(Uuid::parse_str(&id).is_ok());
    }
}
