//! Process entry point. Reads `RuntimeConfig` from the environment, builds the (currently
//! empty; concrete `Message`/`Service` types are an external collaborator per spec §1, §6)
//! opcode table, and drives `Bootstrap::run` to completion.
//!
//! Runs on a current-thread runtime only: `corenet` has no `Send` bound anywhere, so every
//! task it spawns must stay on the one thread that owns the `LocalSet` (SPEC_FULL §5).
use corenet::OpcodeTableBuilder;
use gamecore::{Bootstrap, RuntimeConfig};
use std::rc::Rc;

fn main() {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    // Real domain `Message`/`Service` types register themselves here via
    // `OpcodeTableBuilder::register`; this binary has none of its own.
    let opcodes = Rc::new(OpcodeTableBuilder::new().build());
    let bootstrap = Rc::new(Bootstrap::new(config, opcodes));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build the tokio runtime");
    let local = tokio::task::LocalSet::new();
    let result = local.block_on(&runtime, bootstrap.run());
    if let Err(err) = result {
        eprintln!("server exited with error: {err}");
        std::process::exit(1);
    }
}
