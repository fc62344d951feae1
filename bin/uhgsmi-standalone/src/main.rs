// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kmt_api::{Host, Loader, SystemHost, SystemLoader};
use kmt_sim::{SimDriver, SimHost, SimLoader};
use slog::{debug, info, o, warn, Drain, Logger};
use uhgsmi::{Buffer, Engine, LockFlags, SubmitEntry};

mod config;

use config::Config;

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

/// Fill every byte of `buf` with `val`.
fn fill_buffer(buf: &Buffer<'_>, val: u8) -> uhgsmi::Result<()> {
    let flags = LockFlags::WRITE_ONLY | LockFlags::DISCARD;
    let p = buf.lock(0, buf.size(), flags)?;
    // Safety: the lock maps all `size()` bytes of the buffer
    unsafe { std::ptr::write_bytes(p.as_ptr(), val, buf.size() as usize) };
    buf.unlock()
}

fn run(
    config: &Config,
    loader: &dyn Loader,
    host: Arc<dyn Host>,
    log: &Logger,
) -> anyhow::Result<()> {
    let engine = Engine::create(config.engine.clone(), loader, host, log)
        .context("Failed to create submission engine")?;

    let mut buffers = BTreeMap::new();
    for (name, bcfg) in config.buffers.iter() {
        let buf = engine
            .buffer_create(bcfg.size, bcfg.sync, None)
            .with_context(|| format!("Failed to create buffer {name}"))?;
        if let Some(val) = bcfg.fill {
            fill_buffer(&buf, val)
                .with_context(|| format!("Failed to fill buffer {name}"))?;
        }
        info!(log, "buffer ready";
            "name" => name,
            "size" => buf.size(),
            "sync" => ?buf.sync().kind);
        buffers.insert(name.as_str(), buf);
    }

    for (idx, step) in config.submits.iter().enumerate() {
        let mut entries = Vec::with_capacity(step.buffers.len());
        for r in step.buffers.iter() {
            let buf = buffers
                .get(r.name.as_str())
                .with_context(|| format!("No buffer named {}", r.name))?;
            let entry = match r.range(buf.size()) {
                None => SubmitEntry::whole(buf),
                Some((off, cb)) => SubmitEntry::range(buf, off, cb),
            };
            entries.push(entry.with_flags(r.flags()));
        }
        engine
            .submit_async(&entries)
            .with_context(|| format!("Submit step {idx} failed"))?;
        info!(log, "submitted"; "step" => idx, "buffers" => entries.len());
    }

    for (name, buf) in buffers {
        if let Err(e) = buf.destroy() {
            warn!(log, "failed to destroy buffer";
                "name" => name, "error" => %e);
        }
    }
    engine.destroy().context("Failed to tear down submission engine")
}

fn run_sim(config: &Config, log: &Logger) -> anyhow::Result<()> {
    let driver = SimDriver::new(config.sim);
    let loader = SimLoader::new(driver.clone());
    let host = Arc::new(SimHost::new());

    let res = run(config, &loader, host.clone(), log);

    let calls = driver.calls();
    for call in calls.iter() {
        debug!(log, "driver call"; "call" => ?call);
    }
    info!(log, "simulated driver summary";
        "calls" => calls.len(),
        "live_objects" => driver.live_objects(),
        "open_handles" => host.open_handles().len());
    res
}

#[derive(clap::Parser)]
/// Scripted driver of the user-mode HGSMI submission engine.
struct Args {
    /// TOML script naming the engine, buffers and submissions.
    #[clap(value_name = "CONFIG", action)]
    config: String,

    /// Run against the in-process simulated driver instead of the display
    /// driver of this system.
    #[clap(short, long, action)]
    sim: bool,
}

fn main() -> anyhow::Result<()> {
    let Args { config, sim } = Args::parse();

    let (log, _log_async_guard) = build_log();
    let config = config::parse(&config)?;

    if sim {
        run_sim(&config, &log)
    } else {
        run(&config, &SystemLoader, Arc::new(SystemHost), &log)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_log() -> Logger {
        let decorator =
            slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        Logger::root(slog_term::FullFormat::new(decorator).build().fuse(), o!())
    }

    fn script(mode: &str, names: &[&str]) -> Config {
        let mut raw = format!("[engine]\nmode = \"{mode}\"\n");
        for (i, name) in names.iter().enumerate() {
            raw += &format!(
                "[buffer.{name}]\nsize = 4096\nsync = \"event\"\nfill = {i}\n"
            );
        }
        let refs = names
            .iter()
            .map(|name| format!("{{ name = \"{name}\", off = 16, cb = 64 }}"))
            .collect::<Vec<_>>()
            .join(", ");
        raw += &format!("[[submit]]\nbuffers = [{refs}]\n");
        toml::from_str(&raw).unwrap()
    }

    #[test]
    fn sim_run_direct() {
        let cfg = script("direct", &["a", "b", "c", "d"]);
        run_sim(&cfg, &test_log()).unwrap();
    }

    #[test]
    fn sim_run_escape() {
        let cfg = script("escape", &["a", "b", "c"]);
        run_sim(&cfg, &test_log()).unwrap();
    }

    #[test]
    fn sim_run_escape_batch_too_large() {
        let cfg = script("escape", &["a", "b", "c", "d"]);
        let err = run_sim(&cfg, &test_log()).unwrap_err();
        assert!(format!("{err:#}").contains("Submit step 0"), "{err:#}");
    }
}
