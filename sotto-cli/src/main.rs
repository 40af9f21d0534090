//! Sotto host harness.
//!
//! Stands in for a media pipeline: reads a mono 16-bit WAV, negotiates the
//! format, activates the filter, streams frames through it and prints the
//! transcription events. Forwarded audio is counted on the far side of the
//! downstream channel to show the pass-through contract holding.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam_channel::unbounded;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sotto_core::recognizer::stub::StubBackend;
use sotto_core::{
    Activation, AudioFrame, FilterConfig, FilterStatus, ResultKind, SottoFilter,
    DEFAULT_MODEL_PATH,
};

#[derive(Debug)]
struct Args {
    wav: PathBuf,
    model: PathBuf,
    alternatives: u32,
    partial_interval_ms: i64,
    frame_ms: u64,
}

fn parse_args() -> Result<Args> {
    let mut wav: Option<PathBuf> = None;
    let mut model = PathBuf::from(DEFAULT_MODEL_PATH);
    let mut alternatives = 0u32;
    let mut partial_interval_ms = 0i64;
    let mut frame_ms = 20u64;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--wav" => {
                let Some(v) = it.next() else {
                    bail!("missing value for --wav");
                };
                wav = Some(PathBuf::from(v));
            }
            "--model" => {
                let Some(v) = it.next() else {
                    bail!("missing value for --model");
                };
                model = PathBuf::from(v);
            }
            "--alternatives" => {
                let Some(v) = it.next() else {
                    bail!("missing value for --alternatives");
                };
                alternatives = v.parse().context("invalid value for --alternatives")?;
            }
            "--partial-interval" => {
                let Some(v) = it.next() else {
                    bail!("missing value for --partial-interval");
                };
                partial_interval_ms = v.parse().context("invalid value for --partial-interval")?;
            }
            "--frame-ms" => {
                let Some(v) = it.next() else {
                    bail!("missing value for --frame-ms");
                };
                frame_ms = v
                    .parse::<u64>()
                    .context("invalid value for --frame-ms")?
                    .clamp(5, 500);
            }
            "--help" | "-h" => {
                println!(
                    "Usage: sotto --wav <file.wav> [--model <dir>] [--alternatives <n>] \\
  [--partial-interval <ms|-1>] [--frame-ms <n>]"
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    let Some(wav) = wav else {
        bail!("--wav is required (see --help)");
    };
    Ok(Args {
        wav,
        model,
        alternatives,
        partial_interval_ms,
        frame_ms,
    })
}

fn read_wav_mono_i16(path: &PathBuf) -> Result<(Vec<i16>, u32)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels != 1 {
        bail!("expected mono WAV, got {} channels", spec.channels);
    }
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        bail!("expected 16-bit integer PCM WAV");
    }
    let samples = reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<i16>, _>>()
        .context("decoding WAV samples")?;
    Ok((samples, spec.sample_rate))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = parse_args()?;
    let (samples, rate) = read_wav_mono_i16(&args.wav)?;
    info!(
        wav = %args.wav.display(),
        rate,
        seconds = samples.len() as f64 / rate as f64,
        "loaded audio"
    );

    let (down_tx, down_rx) = unbounded::<AudioFrame>();
    let filter = Arc::new(SottoFilter::new(
        FilterConfig {
            model_path: Some(args.model.clone()),
            alternatives: args.alternatives,
            partial_interval_ms: args.partial_interval_ms,
        },
        Arc::new(StubBackend::new()),
        down_tx,
    ));
    let mut status_rx = filter.subscribe_status();
    let mut transcript_rx = filter.subscribe_transcripts();

    // Downstream sink: counts what comes out the other side.
    let sink = thread::spawn(move || {
        let mut frames = 0u64;
        let mut bytes = 0u64;
        while let Ok(frame) = down_rx.recv() {
            frames += 1;
            bytes += frame.len() as u64;
        }
        (frames, bytes)
    });

    let printer = tokio::spawn(async move {
        while let Ok(ev) = transcript_rx.recv().await {
            let kind = match ev.kind {
                ResultKind::Partial => "partial",
                ResultKind::Final => "final",
            };
            println!("[{kind:>7} #{:04}] {}", ev.seq, ev.text);
        }
    });

    filter.format_changed(rate)?;
    if matches!(filter.activate()?, Activation::Pending) {
        info!("activation pending; waiting for model load");
        loop {
            let ev = status_rx.recv().await.context("status channel closed")?;
            match ev.status {
                FilterStatus::Active => break,
                FilterStatus::Error => {
                    bail!("activation failed: {}", ev.detail.unwrap_or_default())
                }
                _ => {}
            }
        }
    }
    info!("filter active; streaming");

    let samples_per_frame = (u64::from(rate) * args.frame_ms / 1000) as usize;
    let feeder = {
        let filter = Arc::clone(&filter);
        tokio::task::spawn_blocking(move || {
            let mut offset = 0u64;
            for chunk in samples.chunks(samples_per_frame.max(1)) {
                let bytes: Vec<u8> = chunk.iter().flat_map(|s| s.to_le_bytes()).collect();
                let pts = Duration::from_nanos(offset * 1_000_000_000 / u64::from(rate));
                let duration =
                    Duration::from_nanos(chunk.len() as u64 * 1_000_000_000 / u64::from(rate));
                filter.push_frame(AudioFrame::new(bytes, pts, duration));
                offset += chunk.len() as u64;
            }
            filter.end_of_stream();
        })
    };
    feeder.await.context("feeder task failed")?;

    // Let the last events land before tearing down.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snap = filter.diagnostics_snapshot();
    info!(
        frames_in = snap.frames_in,
        frames_fed = snap.frames_fed,
        partials = snap.partials_emitted,
        finals = snap.finals_emitted,
        "stream complete"
    );

    drop(filter);
    let _ = printer.await;
    let (frames, bytes) = sink
        .join()
        .map_err(|_| anyhow::anyhow!("downstream sink panicked"))?;
    println!("forwarded {frames} frames ({bytes} bytes) downstream unchanged");
    Ok(())
}
