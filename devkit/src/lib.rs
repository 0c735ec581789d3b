/*!
# Metrics DevKit - test tooling for the metrics agent

- In-process mock aggregation server (metrics + command relay API)
- Switchable failure modes (offline, 401, missing bulk route, forgotten clients)
- Small async test helpers
*/

pub mod mock_server;
pub mod test_utils;

pub use mock_server::{CommandReport, EmptyPoll, MetricsRoute, MockAggregator, RecordedRequest};
pub use test_utils::{init_logging, state_dir, wait_for, within};
