use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{debug, info, warn};
use maglb::cache::FallbackCache;
use maglb::capture::{AfPacketSocket, Backoff};
use maglb::config::Config;
use maglb::control::ControlPlane;
use maglb::forwarder::{Forwarder, Verdict};
use maglb::stats::{CounterKey, GlobalCounter, StatsCollector};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

const FRAME_BUF: usize = 9216;
const RECV_BACKOFF_MIN: Duration = Duration::from_millis(10);
const RECV_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
struct Opt {
    #[clap(short, long, default_value = "eth0")]
    iface: String,
    #[clap(short, long)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let opt = Opt::parse();

    let config = Config::load(&opt.config).context("failed to load config")?;
    let settings = config.settings.clone();

    let shards = match settings.shards {
        0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
        n => n,
    };
    let stats = StatsCollector::new(shards, settings.max_vips, settings.max_reals);
    let control = ControlPlane::from_config(&config, stats.clone())
        .context("failed to provision tables")?;
    let tables = control.tables();
    let fallback = Arc::new(FallbackCache::new(settings.fallback_lru_size));

    let group = (std::process::id() & 0xffff) as u16;
    for shard in 0..shards {
        let shard_stats = stats
            .shard(shard)
            .context("stats shard missing")?;
        let mut forwarder = Forwarder::new(
            shard as u32,
            &settings,
            Arc::clone(&tables),
            Arc::clone(&fallback),
            shard_stats,
        );
        let mut socket = AfPacketSocket::bind(&opt.iface, group)
            .with_context(|| format!("failed to open {} for shard {}", opt.iface, shard))?;
        tokio::spawn(async move {
            let mut frame = vec![0u8; FRAME_BUF];
            let mut out = vec![0u8; FRAME_BUF];
            let mut backoff = Backoff::new(RECV_BACKOFF_MIN, RECV_BACKOFF_MAX);
            loop {
                let len = match socket.recv(&mut frame).await {
                    Ok(len) => {
                        backoff.reset();
                        len
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(
                            "shard {}: receive failed: {}, retrying in {:?}",
                            forwarder.shard(),
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                };
                match forwarder.process(&frame[..len], &mut out) {
                    Verdict::Tx(n) => {
                        if let Err(e) = socket.send(&out[..n]).await {
                            warn!("shard {}: send failed: {}", forwarder.shard(), e);
                        }
                    }
                    Verdict::Pass => {}
                    Verdict::Drop(reason) => debug!("shard {}: dropped {:?}", forwarder.shard(), reason),
                }
            }
        });
    }
    info!("forwarding on {} with {} shards", opt.iface, shards);

    tokio::spawn(reload_on_hangup(opt.config.clone(), control));
    tokio::spawn(report_stats(
        stats,
        Duration::from_secs(settings.stats_interval_secs.max(1)),
    ));

    info!("Waiting for Ctrl-C...");
    signal::ctrl_c().await?;
    info!("Exiting...");

    Ok(())
}

async fn reload_on_hangup(path: String, mut control: ControlPlane) {
    let mut hangup = match unix_signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!("config reload disabled: {}", e);
            return;
        }
    };
    while hangup.recv().await.is_some() {
        info!("reloading {}", path);
        match Config::load(&path) {
            Ok(config) => {
                if let Err(e) = control.apply(&config) {
                    warn!("failed to apply {}: {}", path, e);
                }
            }
            Err(e) => warn!("failed to load {}: {}", path, e),
        }
    }
}

async fn report_stats(stats: StatsCollector, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let globals: Vec<String> = GlobalCounter::ALL
            .iter()
            .map(|g| {
                let s = stats.get(CounterKey::Global(*g));
                format!("{}={}/{}", g.name(), s.v1, s.v2)
            })
            .collect();
        info!("stats: {}", globals.join(" "));
        let quic = stats.quic();
        debug!(
            "quic: ch_routed={} cid_routed={} cid_initial={} cid_invalid_server_id={} cid_unknown_real={}",
            quic.ch_routed, quic.cid_routed, quic.cid_initial, quic.cid_invalid_server_id, quic.cid_unknown_real
        );
    }
}
