//! Realtime client-session networking core: datagram reliability, session multiplexing,
//! scheduler, codec, dispatch, and rate limiting (spec §1, §3).
//!
//! Nothing in this crate knows how a concrete `Message`/`Service` pair is defined, how a
//! player/account authenticates, or what `game/core`'s config surface looks like beyond the
//! `ProtocolLimits` it reads — those are the external collaborators named in spec §6, wired
//! together by `game/server`'s bootstrap.
pub mod clock;
pub mod codec;
pub mod config;
pub mod datagram;
pub mod dispatch;
pub mod error;
pub mod ids;
pub mod principal;
pub mod ratelimit;
pub mod scheduler;
pub mod schema;
pub mod session;
pub mod stream;

pub use clock::{CancelToken, Clock};
pub use config::ProtocolLimits;
pub use datagram::{DatagramEndpoint, DatagramSocket, PingSweepTask};
pub use dispatch::Dispatcher;
pub use error::{CoreError, CoreResult};
pub use ids::SessionId;
pub use principal::Principal;
pub use scheduler::{EntityTask, Scheduler, Task, TaskId};
pub use schema::{
    Created, DispatchContext, DispatchService, FieldKind, OpcodeTable, OpcodeTableBuilder,
    ServiceOptions, WireMessage, WireService,
};
pub use session::{InboundSink, OutboundTransport, Session, SessionDirectory};
pub use stream::StreamListener;
