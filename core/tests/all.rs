// Aggregates the integration tests as modules under one harness.

mod suite;
