//! Workspace-level integration tests, benchmarks and demos for sqlcoord.
