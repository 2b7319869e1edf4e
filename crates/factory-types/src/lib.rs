pub mod event;
pub mod proposal;
pub mod run;
pub mod usage;

pub use event::*;
pub use proposal::*;
pub use run::*;
pub use usage::*;

/// Prefixed random identifier, e.g. `run_5f0c...`.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_id_is_prefixed_and_unique() {
        let a = new_id("run");
        let b = new_id("run");
        assert!(a.starts_with("run_"));
        assert_ne!(a, b);
    }
}
