//! Integration tests: schedulers driven against an in-memory exchange.

mod scheduler_flow;
