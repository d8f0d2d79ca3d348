/*!
# HostPulse DevKit - test doubles and helpers

Lets the bus and kernel crates test their pipelines without RabbitMQ:
- `MockBroker`: in-memory durable queue implementing the transport seam
- `RecordingSink`: metric sink with switchable outage
- `MessageBuilder`: valid metric message fixtures
- `TestHarness`: wiring plus polling helpers
*/

pub mod broker_stub;
pub mod fixtures;
pub mod sink_stub;
pub mod test_utils;

pub use broker_stub::{MockBroker, MockDelivery, MockSession};
pub use fixtures::{base_time, MessageBuilder};
pub use sink_stub::RecordingSink;
pub use test_utils::{init_tracing, wait_until, within, TestHarness};
