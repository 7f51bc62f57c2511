mod acquisition;
mod clock;
mod config;
mod detector;
mod error;
mod retry;
mod sample;
mod session;
mod telemetry;
mod transport;

use acquisition::AcquisitionLoop;
use clock::{MonotonicUptime, NetworkTimeSource, SntpTimeSource, SystemTimeSource, TimeSourceKind};
use config::Config;
use detector::QrsDetector;
use error::SampleError;
use retry::ThreadSleeper;
use sample::{AdcScale, ReplaySource, SampleSource, SourceKind, SyntheticEcg};
use session::PublishSession;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use transport::MqttTransport;

type BoxError = Box<dyn Error + Send + Sync>;

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), BoxError> {
    let config = Config::load()?;
    log::info!(
        "Publishing to {}:{} topic {}, R-wave thresholds {}/{}",
        config.broker.host,
        config.broker.port,
        config.topics.data,
        config.detector.upper(),
        config.detector.lower()
    );

    let should_stop = Arc::new(AtomicBool::new(false));
    let (done_sender, done_receiver) = tokio::sync::oneshot::channel();

    // The loop blocks on purpose, so it gets its own thread; this thread
    // only waits for Ctrl-C.
    let worker = {
        let should_stop = should_stop.clone();
        std::thread::spawn(move || {
            let result = acquire(config, should_stop);
            let _ = done_sender.send(());
            result
        })
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    log::error!("Cannot listen for Ctrl-C: {}", e);
                }
                log::info!("Shutdown requested");
            }
            _ = done_receiver => {}
        }
    });

    should_stop.store(true, Ordering::Relaxed);
    match worker.join() {
        Ok(result) => result,
        Err(_) => Err("acquisition thread panicked".into()),
    }
}

fn acquire(config: Config, should_stop: Arc<AtomicBool>) -> Result<(), BoxError> {
    let scale = AdcScale::new(config.acquisition.vref_mv);
    let source: Box<dyn SampleSource> = match config.acquisition.source {
        SourceKind::Synthetic => Box::new(SyntheticEcg::new(config.acquisition.synthetic_bpm, scale)),
        SourceKind::Replay => {
            let path = config
                .acquisition
                .replay_path
                .as_deref()
                .ok_or_else(|| SampleError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "acquisition.replay_path is not set",
                )))?;
            let replay = ReplaySource::from_file(path, scale)?;
            log::info!("Replaying {} readings from {}", replay.len(), path.display());
            Box::new(replay)
        }
    };

    let time_source: Box<dyn NetworkTimeSource> = match config.clock.time_source {
        TimeSourceKind::System => Box::new(SystemTimeSource),
        TimeSourceKind::Sntp => Box::new(SntpTimeSource::new(
            config.clock.sntp_server.clone(),
            Duration::from_millis(config.clock.sntp_timeout_ms),
        )),
    };

    let session = PublishSession::new(
        MqttTransport::new(&config.broker)?,
        config.topics.clone(),
        config.retry.network_policy(),
        config.retry.session_policy(),
    );

    let encoder = config
        .payload
        .format
        .encoder(&config.payload.measurement, &config.payload.device);

    let mut acquisition = AcquisitionLoop::new(
        source,
        config.acquisition.channel,
        QrsDetector::new(config.detector),
        config.clock.anchor(),
        time_source,
        MonotonicUptime::new(),
        config.retry.clock_policy(),
        encoder,
        session,
    )
    .with_sample_interval(config.acquisition.sample_interval_ms.map(Duration::from_millis));

    let mut sleeper = ThreadSleeper::new(should_stop.clone());
    acquisition.run(&mut sleeper, &should_stop);
    Ok(())
}
