//! Service dispatch pipeline (C9, spec §4.7): the `InboundSink` every bound `Session`
//! forwards decoded frame bodies to. Decoding (C4) and dispatch (rate limiting, the
//! non-reentrancy lock, `prepare`/`validate`/`run`) are both driven from here so `Session`
//! itself stays ignorant of the opcode table and rate limiter.
use crate::ratelimit::{self, StrictOutcome};
use crate::schema::{DispatchContext, DispatchService, OpcodeTable};
use crate::session::{InboundSink, Session};
use flux::logging::{debug, warn, Logger, LoggerFactory};
use std::rc::Rc;

/// Bound to a `Session` via `Session::set_inbound_sink`. One instance per process — the
/// opcode table is fixed at initialization (spec §3, §9) and shared across every session.
pub struct Dispatcher {
    table: Rc<OpcodeTable>,
    logger: Logger,
}

impl Dispatcher {
    pub fn new(table: Rc<OpcodeTable>, logging: &LoggerFactory) -> Rc<Dispatcher> {
        Rc::new(Dispatcher { table, logger: logging.build("dispatch", None) })
    }
}

impl InboundSink for Dispatcher {
    /// Decode (spec §4.2 "Unknown opcode → logs a warning and returns 'no service'") happens
    /// synchronously here; the pipeline itself (§4.7) runs as its own `spawn_local` task so a
    /// slow `prepare`/`validate`/`run` on one dispatch never blocks the next frame's decode.
    fn receive(&self, session: &Session, body: Vec<u8>, correct_order: Option<bool>) {
        let (&opcode, rest) = match body.split_first() {
            Some(pair) => pair,
            None => {
                warn!(self.logger, "dispatch: empty frame body");
                return;
            }
        };

        let service = match self.table.decode(opcode, rest) {
            Ok(service) => service,
            Err(err) => {
                warn!(self.logger, "dispatch: decode failed, dropping frame"; "opcode" => opcode, "error" => %err);
                return;
            }
        };

        let session = session.clone();
        let logger = self.logger.clone();
        tokio::task::spawn_local(run_pipeline(session, service, correct_order, logger));
    }
}

/// Spec §4.7, steps 3 through 9 (step 1, "verify `created` flag", is structural here: decode
/// is the only path that produces a `Box<dyn DispatchService>`, so there is no way to reach
/// this function with a value application code fabricated by hand; step 2, "merge class
/// defaults over global defaults", is `ServiceOptions::default()` layered under whatever a
/// class's `options()` override changes).
async fn run_pipeline(session: Session, mut service: Box<dyn DispatchService>, correct_order: Option<bool>, logger: Logger) {
    let options = service.options();
    let class = service.service_type_name();

    // Step 3: the correctOrder gate. Skipped when the caller's correctOrder is undefined
    // (the stream path matches any Service regardless of its ordering option, spec §4.4).
    if let Some(wants_in_order) = correct_order {
        if options.correct_order != wants_in_order {
            return;
        }
    }

    // Step 4: resolve the rate-limit period, `getSpeed()` taking precedence over the static
    // `limit` option (spec §4.6 "Speed variants").
    let period_millis = match service.get_speed().await {
        Some(tiles_per_second) => Some(ratelimit::period_from_speed(tiles_per_second)),
        None => options.limit_millis,
    };

    // Step 5: rate limiting, strict or soft per the presence of `errorOnLimit`.
    if let Some(period) = period_millis {
        if options.error_on_limit {
            if let StrictOutcome::ErrorOnLimit(wait) = ratelimit::strict_limit(&session, class, period) {
                let ctx = DispatchContext::new(&session);
                service.error_on_limit(wait, &ctx).await;
                return;
            }
        } else if !ratelimit::soft_limit(&session, class, period).await {
            // Superseded by a later arrival for the same (session, service) key — spec
            // §4.6's coalescing invariant, "the last arrival wins".
            return;
        }
    }

    // Step 6: the non-reentrancy lock. Failure to acquire silently drops the call.
    let locked = options.allow_simultaneously || session.try_enter_service(class);
    if !locked {
        debug!(logger, "dispatch: service already running, call dropped"; "service" => class);
        return;
    }

    // Step 7: prepare, validate, run inside the scoped "currently running service" context.
    let ctx = DispatchContext::new(&session);
    let outcome = async {
        service.prepare(&ctx).await?;
        if service.validate(&ctx).await? {
            service.run(&ctx).await?;
        } else {
            warn!(logger, "dispatch: validation failed, not running"; "service" => class);
        }
        Ok::<(), crate::error::CoreError>(())
    }
    .await;
    if let Err(err) = outcome {
        warn!(logger, "dispatch: service failed"; "service" => class, "error" => %err);
    }

    // Step 8: release the lock.
    if !options.allow_simultaneously {
        session.exit_service(class);
    }

    // Step 9: conditionally record this run against the rate limiter.
    if period_millis.is_some() && (ctx.has_modified_entities() || options.limit_always) {
        session.set_last_run_millis(class, session.now_millis());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::ProtocolLimits;
    use crate::error::CoreResult;
    use std::cell::RefCell;

    struct CountingService {
        ran: Rc<RefCell<u32>>,
        options: crate::schema::ServiceOptions,
    }

    #[async_trait::async_trait(?Send)]
    impl DispatchService for CountingService {
        fn service_type_name(&self) -> &'static str {
            "count"
        }
        fn options(&self) -> crate::schema::ServiceOptions {
            self.options
        }
        async fn run(&mut self, ctx: &DispatchContext<'_>) -> CoreResult<()> {
            *self.ran.borrow_mut() += 1;
            ctx.track_change();
            Ok(())
        }
    }

    fn logging() -> LoggerFactory {
        LoggerFactory::new(flux::logging::LogConfig::default())
    }

    fn session() -> Session {
        Session::create(Clock::new(), ProtocolLimits::default(), &logging())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unordered_service_ignores_the_in_order_delivery() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let ran = Rc::new(RefCell::new(0));
                let service = Box::new(CountingService { ran: ran.clone(), options: Default::default() });
                run_pipeline(session(), service, Some(true), logging().build("test", None)).await;
                assert_eq!(*ran.borrow(), 0);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unordered_service_runs_on_out_of_order_delivery() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let ran = Rc::new(RefCell::new(0));
                let service = Box::new(CountingService { ran: ran.clone(), options: Default::default() });
                run_pipeline(session(), service, Some(false), logging().build("test", None)).await;
                assert_eq!(*ran.borrow(), 1);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stream_path_ignores_the_gate() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let ran = Rc::new(RefCell::new(0));
                let service = Box::new(CountingService { ran: ran.clone(), options: Default::default() });
                run_pipeline(session(), service, None, logging().build("test", None)).await;
                assert_eq!(*ran.borrow(), 1);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reentrant_call_is_dropped_while_the_first_still_holds_the_lock() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let session = session();
                assert!(session.try_enter_service("count"));

                let ran = Rc::new(RefCell::new(0));
                let service = Box::new(CountingService { ran: ran.clone(), options: Default::default() });
                run_pipeline(session.clone(), service, None, logging().build("test", None)).await;

                assert_eq!(*ran.borrow(), 0);
                session.exit_service("count");
            })
            .await;
    }
}
