//! Realtime demo for the deterministic timer scheduler
//!
//! Two labeled domains tick side by side on the wall clock while a control
//! callback stops them after the requested duration.
//!
//! Usage:
//!   cargo run --bin ticker_demo -- --rate 2.0 --duration 3000
//!   RUST_LOG=det_timers=debug cargo run --bin ticker_demo
//!
//! Domains:
//!   metronome - beat every 250 ms, accent every 4th beat via priority
//!   sensor    - sample every 400 ms, every 3rd sample fails and goes to on_error
//!   control   - one-shot that cancels everything at --duration

use det_timers::{
    CallbackError, CallbackId, CallbackOptions, DomainLabel, EngineConfig, RealtimeRunner,
};
use std::cell::{Cell, RefCell};
use std::env;
use std::rc::Rc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn print_usage() {
    println!("ticker_demo - deterministic timers on the wall clock");
    println!();
    println!("Usage: cargo run --bin ticker_demo -- [--rate <R>] [--duration <MS>]");
    println!("  --rate, -r      logical milliseconds per wall millisecond (default 1.0)");
    println!("  --duration, -d  logical run time in milliseconds (default 2000)");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    let mut rate = 1.0_f64;
    let mut duration_ms: i64 = 2000;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--rate" | "-r" => {
                i += 1;
                if i < args.len() {
                    rate = args[i].parse()?;
                }
            }
            "--duration" | "-d" => {
                i += 1;
                if i < args.len() {
                    duration_ms = args[i].parse()?;
                }
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => warn!(arg = other, "ignoring unknown argument"),
        }
        i += 1;
    }

    if !(rate.is_finite() && rate > 0.0) {
        return Err(format!("Invalid rate {}. Must be positive.", rate).into());
    }

    let mut runner: RealtimeRunner = RealtimeRunner::with_config(EngineConfig {
        rate,
        ..Default::default()
    });
    let sched = runner.scheduler();
    let ids: Rc<RefCell<Vec<CallbackId>>> = Rc::default();

    // Metronome: the accent shares the beat's due time and wins on priority.
    let beats = Rc::new(Cell::new(0u32));
    let s = sched.clone();
    let b = beats.clone();
    let beat = sched.schedule_repeating(
        move || {
            b.set(b.get() + 1);
            let t = s.logical_time(&DomainLabel::named("metronome")).unwrap_or(0);
            info!(beat = b.get(), logical = t, "tick");
            Ok(())
        },
        250,
        CallbackOptions::new().domain("metronome"),
    )?;
    let accent = sched.schedule_repeating(
        || {
            info!("accent");
            Ok(())
        },
        1000,
        CallbackOptions::new().domain("metronome").priority(0),
    )?;

    // Sensor: failures are routed to the error handler, the timer keeps going.
    let samples = Rc::new(Cell::new(0u32));
    let failures = Rc::new(Cell::new(0u32));
    let n = samples.clone();
    let f = failures.clone();
    let sensor = sched.schedule_repeating(
        move || {
            n.set(n.get() + 1);
            if n.get() % 3 == 0 {
                return Err(CallbackError::failed(format!("sample {} dropped", n.get())));
            }
            info!(sample = n.get(), "sensor read");
            Ok(())
        },
        400,
        CallbackOptions::new()
            .domain("sensor")
            .on_error(move |err| {
                f.set(f.get() + 1);
                warn!(%err, "sensor failure handled");
            }),
    )?;
    ids.borrow_mut().extend([beat, accent, sensor]);

    // Control: stop every periodic callback once the duration has elapsed.
    let s = sched.clone();
    let to_cancel = ids.clone();
    sched.schedule_once(
        move || {
            for id in to_cancel.borrow().iter() {
                s.cancel_repeating(*id);
            }
            info!("control: all tickers cancelled");
            Ok(())
        },
        duration_ms,
        CallbackOptions::new().domain("control"),
    )?;

    info!(rate, duration_ms, "running");
    let report = runner.run_until_idle()?;

    info!(
        executed = report.executed,
        failed = report.failed,
        ticks = report.ticks,
        beats = beats.get(),
        samples = samples.get(),
        handled_failures = failures.get(),
        "done"
    );
    Ok(())
}
