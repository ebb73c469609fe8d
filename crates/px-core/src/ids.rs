use uuid::Uuid;

/// Generate an experiment id (`exp-<uuid>`).
pub fn experiment_id() -> String {
    format!("exp-{}", Uuid::new_v4())
}

/// Generate a deployment id (`dep-<uuid>`).
pub fn deployment_id() -> String {
    format!("dep-{}", Uuid::new_v4())
}

/// Generate a task id (`task-<uuid>`).
pub fn task_id() -> String {
    format!("task-{}", Uuid::new_v4())
}

/// Generate a JWT id.
pub fn jwt_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        assert!(experiment_id().starts_with("exp-"));
        assert!(deployment_id().starts_with("dep-"));
        assert!(task_id().starts_with("task-"));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(task_id(), task_id());
    }
}
