pub mod connection;
pub mod payload;
pub mod retry_item;
pub mod sent_order;
pub mod sync_log;

#[allow(unused_imports)]
pub use connection::{CircuitSnapshot, CircuitState, Connection, NewConnection};
#[allow(unused_imports)]
pub use payload::{OrderLinePayload, OrderPayload, PartnerPayload};
#[allow(unused_imports)]
pub use retry_item::{RetryItem, RetryStatus};
#[allow(unused_imports)]
pub use sent_order::SentOrder;
#[allow(unused_imports)]
pub use sync_log::SyncLog;
