mod budget;
mod completion;
mod connection;
mod request;
mod sender;
mod settings;
mod throttle;
mod worker;

pub use budget::{OutbufBudget, Reservation};
pub use completion::{Completions, SendCallback};
pub use connection::ConnState;
pub use request::{Disposition, Request, RequestId};
pub use sender::{SendError, SendOptions, Sender};
pub use settings::Settings;
pub use throttle::ConnectThrottle;
pub use worker::{Worker, WorkerHandle};
