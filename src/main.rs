//! The streamer daemon: wires the pipeline, the HTTP server and the sinks.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use vstream::config::{AppConfig, Cli};
use vstream::server::{H264Info, Server};
use vstream::sink::{H264Stream, Memsink};
use vstream::stream::{Pipeline, StreamOutput};

// Exit codes: 0 normal, 1 argument error, 2 initialization error,
// 3 runtime fatal.
fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("error: {message}");
            return ExitCode::from(1);
        }
    };

    let filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

fn run(config: AppConfig) -> Result<(), u8> {
    info!("starting streamer");

    // Broken stream clients must surface as write errors, not kill us.
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            info!("stop requested");
            stop.store(true, Ordering::SeqCst);
        })
        .map_err(|err| {
            error!(error = %err, "can't install signal handlers");
            2u8
        })?;
    }

    let output = Arc::new(StreamOutput::new());

    let jpeg_sink = match &config.jpeg_sink {
        None => None,
        Some(settings) => Some(
            Memsink::server(&settings.name, settings.mode, settings.rm, settings.client_ttl)
                .map_err(|err| {
                    error!(error = %err, "can't initialize JPEG sink");
                    2u8
                })?,
        ),
    };

    let (h264, h264_info) = match &config.h264_sink {
        None => (None, None),
        Some(settings) => {
            let sink =
                Memsink::server(&settings.name, settings.mode, settings.rm, settings.client_ttl)
                    .map_err(|err| {
                        error!(error = %err, "can't initialize H.264 sink");
                        2u8
                    })?;
            let stream = H264Stream::new(
                sink,
                config.h264_bitrate,
                config.h264_gop,
                config.stream.desired_fps,
            );
            let info = H264Info {
                bitrate_kbps: config.h264_bitrate,
                gop: config.h264_gop,
                online: stream.online_handle(),
            };
            (Some(stream), Some(info))
        }
    };

    let mut pipeline = Pipeline::new(
        config.stream,
        Arc::clone(&output),
        jpeg_sink,
        h264,
        Arc::clone(&stop),
    );
    #[cfg(feature = "drm-output")]
    if let Some(drm_config) = config.drm {
        pipeline.set_drm(vstream::drm::DrmOutput::new(drm_config));
    }
    let encoder = pipeline.encoder();

    let server = Server::bind(&config.server, Arc::clone(&output), encoder, h264_info)
        .map_err(|err| {
        error!(error = %err, "can't initialize HTTP server");
        2u8
    })?;

    let pipeline_handle = thread::Builder::new()
        .name("pipeline".into())
        .spawn(move || pipeline.run())
        .expect("spawning the pipeline thread never fails");

    let http_stop = Arc::clone(&stop);
    let http_handle = thread::Builder::new()
        .name("http".into())
        .spawn(move || server.run(http_stop))
        .expect("spawning the http thread never fails");

    let mut failed = false;
    match http_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(error = %err, "HTTP server failed");
            failed = true;
        }
        Err(_) => {
            error!("HTTP thread panicked");
            failed = true;
        }
    }
    // The reactor exits on stop; make sure the pipeline follows.
    stop.store(true, Ordering::SeqCst);
    if pipeline_handle.join().is_err() {
        error!("pipeline thread panicked");
        failed = true;
    }

    if failed {
        return Err(3);
    }
    info!("bye");
    Ok(())
}
