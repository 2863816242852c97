//! demo - end-to-end synthetic run of the pothole stream pipeline
//!
//! Opens a `stub://` video, runs it through a scripted detector, writes the
//! multipart stream body to disk and prints the SSE transcript a subscriber
//! would have received.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use roadwatch::detect::StubOutcome;
use roadwatch::{
    CameraSettings, Detection, EventQueue, FrameAnnotator, FramePipeline, MultipartEncoder,
    NotifierMessage, PipelineOptions, SharedOracle, SourceKind, SourceManager, StreamPublisher,
    StubBackend, SystemOpener,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of synthetic frames.
    #[arg(long, default_value_t = 30)]
    frames: u32,
    /// Flag a pothole on every Nth frame.
    #[arg(long, default_value_t = 5)]
    every: u32,
    /// Frame width.
    #[arg(long, default_value_t = 320)]
    width: u32,
    /// Frame height.
    #[arg(long, default_value_t = 240)]
    height: u32,
    /// Output directory for the stream body.
    #[arg(long, default_value = "demo_out")]
    out: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.every == 0 {
        return Err(anyhow!("every must be >= 1"));
    }

    let out_dir = PathBuf::from(&args.out);
    fs::create_dir_all(&out_dir)?;

    let manager = Arc::new(SourceManager::new(
        Arc::new(SystemOpener),
        CameraSettings::default(),
    ));
    let source = format!(
        "stub://demo?frames={}&width={}&height={}",
        args.frames, args.width, args.height
    );
    manager.open_file(&source)?;
    let lease = manager
        .lease(SourceKind::File)
        .ok_or_else(|| anyhow!("file source did not open"))?;

    let oracle: SharedOracle = Arc::new(Mutex::new(scripted_detector(&args)));
    let queue = Arc::new(EventQueue::new());
    let pipeline = FramePipeline::new(
        Arc::clone(&manager),
        lease,
        oracle,
        FrameAnnotator::default(),
        Arc::clone(&queue),
        PipelineOptions::default(),
    );

    let body_path = out_dir.join("video_feed.mjpeg");
    let file = fs::File::create(&body_path)
        .with_context(|| format!("create {}", body_path.display()))?;
    let mut writer = BufWriter::new(file);
    let publisher = StreamPublisher::new(MultipartEncoder::new("frame", 95));
    let stats = publisher.publish(pipeline, &mut writer);
    drop(writer);

    println!(
        "stream: {} frames, {} bytes -> {} ({:?})",
        stats.frames_sent,
        stats.bytes_sent,
        body_path.display(),
        stats.outcome
    );

    println!("events:");
    while let Some(event) = queue.try_pop() {
        print!("{}", NotifierMessage::Detection(event).to_sse());
    }
    print!("{}", NotifierMessage::Close.to_sse());

    Ok(())
}

fn scripted_detector(args: &Args) -> StubBackend {
    let box_w = (args.width / 4).max(1) as i32;
    let box_h = (args.height / 6).max(1) as i32;
    let left = (args.width / 3) as i32;
    let top = (args.height / 2) as i32;
    let script = (0..args.every)
        .map(|i| {
            if i + 1 == args.every {
                StubOutcome::Detections(vec![Detection::new(
                    [left, top, left + box_w, top + box_h],
                    "pothole",
                    0.87,
                )])
            } else {
                StubOutcome::Detections(Vec::new())
            }
        })
        .collect();
    StubBackend::with_script(script)
}
