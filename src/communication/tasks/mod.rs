//! Pool tasks that each own one socket's send or receive loop, plus the
//! accept-loop task that spawns a sender/receiver pair per connection.

pub mod receiver;
pub mod sender;
pub mod server_task;

pub use receiver::ReceiverTask;
pub use sender::SenderTask;
pub use server_task::ServerTask;
