//! Fixture programs for exercising the checker.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature (and in this
//! crate's own tests):
//!
//! ```toml
//! [dev-dependencies]
//! machcheck = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Programs
//!
//! | Fixture                  | Machines              | Expected verdict            |
//! |--------------------------|-----------------------|-----------------------------|
//! | [`ping_pong`]            | `Client`, `Server`    | correct, 2 steps            |
//! | [`ping_pong_watched`]    | + `Progress` monitor  | liveness violation          |
//! | [`stuck_request`]        | `Asker`, `Busy`       | deadlock                    |
//! | [`coin_flips`]           | `Flipper`             | correct, `2^depth` schedules|
//! | [`racing_reporters`]     | `Collector`, `Reporter` | assertion failure         |
//! | [`request_reply`]        | `Caller`, `Callee`    | correct, uses a continuation|

use std::sync::Arc;

use crate::core::MachineId;
use crate::error::SpecificationError;
use crate::program::{MachineType, Program, ProgramBuilder};
use crate::value::Value;

type Built = Result<Arc<Program>, SpecificationError>;

/// `Client` creates `Server` and sends it `Ping`. `Server` answers `Pong`
/// and halts in the same handler, so the `Pong` never leaves its buffer.
pub fn ping_pong() -> Built {
    Ok(Arc::new(ping_pong_builder()?.build()?))
}

fn ping_pong_builder() -> Result<ProgramBuilder, SpecificationError> {
    let client = MachineType::builder("Client")
        .var("replies", 0)
        .start("Init")
        .state("Init", |s| {
            s.entry(|ctx, _| {
                let me = Value::Machine(ctx.id().clone());
                let server = ctx.create("Server", Some(me))?;
                ctx.send(&server, "Ping", None)
            })
            .on("Pong", |ctx, _| {
                let n = ctx.get_int("replies")?;
                ctx.set("replies", n + 1)
            })
        })
        .build()?;

    let server = MachineType::builder("Server")
        .var("client", Value::Null)
        .start("Wait")
        .state("Wait", |s| {
            s.entry(|ctx, payload| ctx.set("client", payload.cloned().unwrap_or_default()))
                .on("Ping", |ctx, _| {
                    if let Some(client) = ctx.get("client")?.as_machine().cloned() {
                        ctx.send(&client, "Pong", None)?;
                    }
                    ctx.halt();
                    Ok(())
                })
        })
        .build()?;

    Ok(Program::builder("ping_pong").machine(client).machine(server).start("Client"))
}

/// [`ping_pong`] plus a monitor that turns hot on `Ping` and cools down on
/// `Pong`. Since `Pong` is never delivered, the run ends hot.
pub fn ping_pong_watched() -> Built {
    let progress = MachineType::builder("Progress")
        .start("Idle")
        .state("Idle", |s| s.cold().goto_on("Ping", "Waiting").ignore("Pong"))
        .state("Waiting", |s| s.hot().goto_on("Pong", "Idle").ignore("Ping"))
        .build()?;
    Ok(Arc::new(
        ping_pong_builder()?
            .monitor(progress, ["Ping", "Pong"])
            .build()?,
    ))
}

/// `Asker` creates `Busy` and sends it `Wait`, which `Busy` defers forever.
pub fn stuck_request() -> Built {
    let asker = MachineType::builder("Asker")
        .start("Ask")
        .state("Ask", |s| {
            s.entry(|ctx, _| {
                let busy = ctx.create("Busy", None)?;
                ctx.send(&busy, "Wait", None)
            })
        })
        .build()?;
    let busy = MachineType::builder("Busy")
        .start("Working")
        .state("Working", |s| s.defer("Wait"))
        .build()?;
    Ok(Arc::new(
        Program::builder("stuck_request")
            .machine(asker)
            .machine(busy)
            .start("Asker")
            .build()?,
    ))
}

/// One machine making `depth` boolean choices while it starts. Its `path`
/// variable encodes the choices as bits.
pub fn coin_flips(depth: usize) -> Built {
    let flipper = MachineType::builder("Flipper")
        .var("path", 0)
        .start("Flip")
        .state("Flip", move |s| {
            s.entry(move |ctx, _| {
                let mut path = 0i64;
                for bit in 0..depth {
                    if ctx.choose_bool()? {
                        path |= 1 << bit;
                    }
                }
                ctx.set("path", path)
            })
        })
        .build()?;
    Ok(Arc::new(
        Program::builder("coin_flips").machine(flipper).start("Flipper").build()?,
    ))
}

/// `Collector` creates `reporters` reporters which each send it `Report`
/// with their index. The collector asserts reports arrive in index order,
/// which only some interleavings satisfy.
pub fn racing_reporters(reporters: i64) -> Built {
    let collector = MachineType::builder("Collector")
        .var("expected", 0)
        .start("Collect")
        .state("Collect", move |s| {
            s.entry(move |ctx, _| {
                for i in 0..reporters {
                    let me = Value::Machine(ctx.id().clone());
                    ctx.create("Reporter", Some(Value::Tuple(vec![me, Value::Int(i)])))?;
                }
                Ok(())
            })
            .on("Report", |ctx, payload| {
                let got = payload.and_then(Value::as_int).unwrap_or(-1);
                let expected = ctx.get_int("expected")?;
                ctx.assert(got == expected, format!("report {} arrived before {}", got, expected))?;
                ctx.set("expected", expected + 1)
            })
        })
        .build()?;
    let reporter = MachineType::builder("Reporter")
        .start("Report")
        .state("Report", |s| {
            s.entry(|ctx, payload| {
                let (collector, index) = match payload {
                    Some(Value::Tuple(items)) => match items.as_slice() {
                        [Value::Machine(c), Value::Int(i)] => (c.clone(), *i),
                        _ => return ctx.assert(false, "malformed reporter payload"),
                    },
                    _ => return ctx.assert(false, "missing reporter payload"),
                };
                ctx.send(&collector, "Report", Some(Value::Int(index)))
            })
        })
        .build()?;
    Ok(Arc::new(
        Program::builder("racing_reporters")
            .machine(collector)
            .machine(reporter)
            .start("Collector")
            .build()?,
    ))
}

/// `Caller` sends `Request` and blocks until `Reply`. `Callee` sends a
/// `Note` before the `Reply`; the note is deferred while the caller waits and
/// handled afterwards in `Done`.
pub fn request_reply() -> Built {
    let caller = MachineType::builder("Caller")
        .var("answer", Value::Null)
        .var("notes", 0)
        .var("scratch", 0)
        .start("Ask")
        .state("Ask", |s| {
            s.entry(|ctx, _| {
                let me = Value::Machine(ctx.id().clone());
                let callee = ctx.create("Callee", Some(me))?;
                ctx.send(&callee, "Request", Some(Value::Int(20)))?;
                ctx.set("scratch", 1)?;
                ctx.receive("await_reply")
            })
            .exit(|ctx, _| ctx.set("scratch", 2))
        })
        .state("Done", |s| {
            s.on("Note", |ctx, _| {
                let n = ctx.get_int("notes")?;
                ctx.set("notes", n + 1)
            })
        })
        .continuation_with_clear(
            "await_reply",
            ["Reply"],
            |ctx, message| {
                ctx.set("answer", message.payload.clone().unwrap_or_default())?;
                ctx.goto("Done", None)
            },
            |vars| {
                vars.insert("scratch".to_string(), Value::Int(0));
            },
        )
        .build()?;
    let callee = MachineType::builder("Callee")
        .var("caller", Value::Null)
        .start("Serve")
        .state("Serve", |s| {
            s.entry(|ctx, payload| ctx.set("caller", payload.cloned().unwrap_or_default()))
                .on("Request", |ctx, payload| {
                    let caller: Option<MachineId> = ctx.get("caller")?.as_machine().cloned();
                    let question = payload.and_then(Value::as_int).unwrap_or(0);
                    if let Some(caller) = caller {
                        ctx.send(&caller, "Note", None)?;
                        ctx.send(&caller, "Reply", Some(Value::Int(question + 22)))?;
                    }
                    Ok(())
                })
        })
        .build()?;
    Ok(Arc::new(
        Program::builder("request_reply")
            .machine(caller)
            .machine(callee)
            .start("Caller")
            .build()?,
    ))
}
