use thiserror::Error;

/// Errors raised by graph construction, planning and state locking.
///
/// Graph and configuration errors are raised before any provider call is
/// made. Lease and state errors come from the state store.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("dependency cycle detected: {}", format_cycle(.members))]
    Cycle { members: Vec<String> },

    #[error("resource '{resource}' references unknown resource '{target}'")]
    UnresolvedReference { resource: String, target: String },

    #[error("resource '{0}' is declared more than once")]
    DuplicateResource(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("stack '{stack}' is locked by {holder} (lease {lease_id}, expires {expires_at})")]
    LockContention {
        stack: String,
        holder: String,
        lease_id: String,
        expires_at: String,
    },

    #[error("lease {lease_id} on stack '{stack}' is no longer held")]
    LeaseLost { stack: String, lease_id: String },

    #[error("state store: {0}")]
    State(String),
}

impl EngineError {
    /// Process exit code for this error class.
    pub fn exit_code(&self) -> u8 {
        match self {
            EngineError::LockContention { .. } | EngineError::LeaseLost { .. } => 3,
            _ => 2,
        }
    }
}

fn format_cycle(members: &[String]) -> String {
    match members.first() {
        Some(first) => format!("{} -> {}", members.join(" -> "), first),
        None => String::from("(empty)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_closes_the_loop() {
        let err = EngineError::Cycle {
            members: vec!["a".into(), "b".into(), "c".into()],
        };
        assert_eq!(
            err.to_string(),
            "dependency cycle detected: a -> b -> c -> a"
        );
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn lock_contention_has_distinct_exit_code() {
        let err = EngineError::LockContention {
            stack: "prod".into(),
            holder: "ci-1".into(),
            lease_id: "l-1".into(),
            expires_at: "2030-01-01T00:00:00Z".into(),
        };
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("ci-1"));
    }
}
