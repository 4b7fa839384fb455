//! Wires the networking core's pieces together into one running process (spec §6, SPEC_FULL
//! §4.10): the UDP datagram endpoint, the WebSocket stream listener, the dispatcher, and the
//! scheduler's own drive loop plus the `flush_logs` housekeeping task (SPEC_FULL §4.1).
use crate::config::RuntimeConfig;
use crate::directory::TokenDirectory;
use corenet::{Clock, DatagramEndpoint, Dispatcher, OpcodeTable, PingSweepTask, Scheduler, StreamListener, Task, TaskId};
use flux::logging::{info, warn, LoggerFactory};
use std::cell::RefCell;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};

/// Scheduler tick period (spec §4.1's `init(tickMs)`); 20 logical ticks/second, matching the
/// teacher's own `Game { fps: 20 }` default.
const TICK_MILLIS: u64 = 50;

const PING_SWEEP_PRIORITY_PERIOD_MILLIS: u64 = 500;

/// Priority `i32::MAX` (SPEC_FULL §4.1): runs dead last in every tick, after anything that
/// might itself log.
const FLUSH_LOGS_PRIORITY: i32 = i32::MAX;

const DIRECTORY_SWEEP_PERIOD_MILLIS: u64 = 5_000;

/// Periodically drops closed sessions from the token index (spec §4.5's `close()`
/// deregistration, applied out-of-band since `Session` doesn't hold a reference back to the
/// directory it was registered with).
struct DirectorySweepTask {
    directory: Rc<TokenDirectory>,
    remaining: std::cell::Cell<Option<u32>>,
}

impl Task for DirectorySweepTask {
    fn period_millis(&self) -> u64 {
        DIRECTORY_SWEEP_PERIOD_MILLIS
    }
    fn priority(&self) -> i32 {
        0
    }
    fn remaining(&self) -> Option<u32> {
        self.remaining.get()
    }
    fn set_remaining(&self, value: Option<u32>) {
        self.remaining.set(value);
    }
    fn run(self: Rc<Self>, _delta: u64) -> corenet::scheduler::BoxFuture {
        self.directory.sweep();
        Box::pin(std::future::ready(Ok(())))
    }
}

struct FlushLogsTask {
    flush: flux::logging::FlushHandle,
    remaining: std::cell::Cell<Option<u32>>,
}

impl Task for FlushLogsTask {
    fn period_millis(&self) -> u64 {
        1_000
    }
    fn priority(&self) -> i32 {
        FLUSH_LOGS_PRIORITY
    }
    fn remaining(&self) -> Option<u32> {
        self.remaining.get()
    }
    fn set_remaining(&self, value: Option<u32>) {
        self.remaining.set(value);
    }
    fn run(self: Rc<Self>, _delta: u64) -> corenet::scheduler::BoxFuture {
        Box::pin(async move {
            self.flush.flush_all();
            Ok(())
        })
    }
}

/// Everything needed to run the server's main loop. Built once at startup; `run` drives it
/// until `ctrl_c` fires.
pub struct Bootstrap {
    config: RuntimeConfig,
    clock: Clock,
    logging: Rc<LoggerFactory>,
    scheduler: RefCell<Scheduler>,
    directory: Rc<TokenDirectory>,
    opcodes: Rc<OpcodeTable>,
    ping_task_id: RefCell<Option<TaskId>>,
}

impl Bootstrap {
    /// `opcodes` is supplied by the caller (`game/server`'s `main`) because the concrete
    /// Message/Service schema is an external collaborator this crate has no knowledge of
    /// (spec §1, §6 "schema provider").
    pub fn new(config: RuntimeConfig, opcodes: Rc<OpcodeTable>) -> Bootstrap {
        let clock = Clock::new();
        let logging = Rc::new(LoggerFactory::new(config.log.clone()));
        let scheduler = RefCell::new(Scheduler::new(clock.clone(), &logging));
        Bootstrap {
            config,
            clock,
            logging,
            scheduler,
            directory: TokenDirectory::new(),
            opcodes,
            ping_task_id: RefCell::new(None),
        }
    }

    /// Binds both transports, registers the scheduler's housekeeping tasks, and runs until
    /// `ctrl_c`. Must be called from inside a `tokio::task::LocalSet` (spec §5, SPEC_FULL §5:
    /// the core has no `Send` bound anywhere).
    pub async fn run(self: Rc<Self>) -> corenet::CoreResult<()> {
        let logger = self.logging.build("bootstrap", None);

        let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.udp_port)).await?;
        let endpoint = DatagramEndpoint::new(udp, self.clock.clone(), self.config.limits, &self.logging, self.directory.clone());
        tokio::task::spawn_local(endpoint.clone().run_receive_loop());

        let ping_task = PingSweepTask::new(endpoint.clone(), PING_SWEEP_PRIORITY_PERIOD_MILLIS);
        let ping_id = self.scheduler.borrow_mut().add_task(ping_task);
        *self.ping_task_id.borrow_mut() = Some(ping_id);

        let dispatcher = Dispatcher::new(self.opcodes.clone(), &self.logging);
        let stream_listener = StreamListener::new(
            self.opcodes.clone(),
            self.clock.clone(),
            self.config.limits,
            self.directory.clone() as Rc<dyn corenet::SessionDirectory>,
            dispatcher.clone() as Rc<dyn corenet::InboundSink>,
            self.config.ws_path.clone(),
            self.logging.clone(),
        );
        let tcp_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.ws_port));
        let tcp_listener = TcpListener::bind(tcp_addr).await?;
        tokio::task::spawn_local(stream_listener.run_accept_loop(tcp_listener));

        let flush_task = Rc::new(FlushLogsTask { flush: self.logging.flush_handle(), remaining: std::cell::Cell::new(None) });
        self.scheduler.borrow_mut().add_task(flush_task);

        let sweep_task = Rc::new(DirectorySweepTask { directory: self.directory.clone(), remaining: std::cell::Cell::new(None) });
        self.scheduler.borrow_mut().add_task(sweep_task);

        self.scheduler.borrow_mut().init();

        info!(logger, "listening"; "ws_port" => self.config.ws_port, "udp_port" => self.config.udp_port, "ws_path" => %self.config.ws_path);

        let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MILLIS));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scheduler.borrow_mut().tick().await;
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!(logger, "ctrl_c received, stopping scheduler");
                    self.scheduler.borrow_mut().stop();
                    break;
                }
            }
        }
        Ok(())
    }
}
