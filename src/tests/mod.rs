//! End-to-end scenario tests, mirroring the literal values used to pin
//! down the orchestrator's behavior across mask changes, observation
//! augmentation, and the step-length schedule.
