//! Capture frames from the write-back device of a simulated display
//! subsystem.
//!
//! A background thread plays the role of the display controller and raises a
//! frame-done interrupt at a fixed interval. The main thread runs the usual
//! V4L2 capture loop on top of it: set the format, map the buffers, queue
//! them, stream on, then dequeue and requeue until enough frames have been
//! captured.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context};
use clap::{value_parser, Arg, Command};
use nix::fcntl::OFlag;

use omap_wb::ioctl::*;
use omap_wb::memory::MemoryType;
use omap_wb::platform::sim::{SimDss, SimTiler};
use omap_wb::platform::{Platform, WbCaptureMode, WbSource};
use omap_wb::{Format, PixelFormat, QueueType, WbConfig, WbDriver};

fn parse_size(s: &str) -> anyhow::Result<(usize, usize)> {
    let (width, height) = s
        .split_once('x')
        .ok_or_else(|| anyhow!("invalid frame size {:?}", s))?;

    Ok((width.parse()?, height.parse()?))
}

fn parse_source(s: &str) -> anyhow::Result<WbSource> {
    match s {
        "lcd1" => Ok(WbSource::Lcd1Manager),
        "lcd2" => Ok(WbSource::Lcd2Manager),
        "tv" => Ok(WbSource::TvManager),
        "gfx" => Ok(WbSource::Overlay0),
        "vid1" => Ok(WbSource::Overlay1),
        "vid2" => Ok(WbSource::Overlay2),
        "vid3" => Ok(WbSource::Overlay3),
        _ => Err(anyhow!("unknown write-back source {:?}", s)),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = Command::new("OMAP write-back capture")
        .arg(
            Arg::new("num_frames")
                .long("stop_after")
                .takes_value(true)
                .default_value("30")
                .value_parser(value_parser!(u32))
                .help("Stop after capturing this number of frames"),
        )
        .arg(
            Arg::new("pixelformat")
                .long("format")
                .takes_value(true)
                .default_value("RGB4")
                .help("FourCC of the capture format (RGBP, RGB3, RGB4, BA24, YUYV, UYVY, NV12)"),
        )
        .arg(
            Arg::new("frame_size")
                .long("frame_size")
                .takes_value(true)
                .default_value("640x480")
                .help("Size of the captured frames (e.g. \"640x480\")"),
        )
        .arg(
            Arg::new("num_buffers")
                .long("buffers")
                .takes_value(true)
                .default_value("4")
                .value_parser(value_parser!(u32))
                .help("Number of buffers to request (at least 2)"),
        )
        .arg(
            Arg::new("source")
                .long("source")
                .takes_value(true)
                .default_value("lcd1")
                .help("What to capture (lcd1, lcd2, tv, gfx, vid1, vid2, vid3)"),
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .takes_value(true)
                .default_value("16")
                .value_parser(value_parser!(u64))
                .help("Milliseconds between two simulated frame interrupts"),
        )
        .get_matches();

    let stop_after = *matches.get_one::<u32>("num_frames").unwrap();
    let num_buffers = *matches.get_one::<u32>("num_buffers").unwrap();
    let interval = Duration::from_millis(*matches.get_one::<u64>("interval").unwrap());
    let fourcc: [u8; 4] = matches
        .get_one::<String>("pixelformat")
        .unwrap()
        .as_bytes()
        .try_into()
        .context("pixel format must be a FourCC")?;
    let frame_size = parse_size(matches.get_one::<String>("frame_size").unwrap())?;
    let source = parse_source(matches.get_one::<String>("source").unwrap())?;

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .context("Failed to set Ctrl-C handler")?;
    }

    let dss = Arc::new(SimDss::default());
    let tiler = Arc::new(SimTiler::new());
    let driver = WbDriver::probe(
        Platform::new(dss.clone(), tiler.clone()),
        WbConfig::default(),
    )?;
    let device = driver
        .device(0)
        .ok_or_else(|| anyhow!("no write-back device"))?;
    // Non-blocking, so that Ctrl-C is noticed while waiting for a frame.
    let file = device.open(OFlag::O_RDWR | OFlag::O_NONBLOCK);

    print!("{}", querycap(&file));

    let format = s_fmt(&file, Format::from((&fourcc, frame_size)))?;
    println!(
        "Capture format: {} {}x{}, {} bytes per line, window {}",
        format.pixelformat,
        format.width,
        format.height,
        format.plane_fmt[0].bytesperline,
        g_fmt_overlay(&file)
    );

    s_wb(
        &file,
        WbSettings {
            enabled: true,
            source,
            source_type: source.source_type(),
            capture_mode: WbCaptureMode::All,
        },
    )?;

    let count = reqbufs(&file, QueueType::VideoCapture, MemoryType::MMAP, num_buffers)?;
    // A frame only completes once the next one is programmed behind it.
    ensure!(
        count >= 2,
        "at least 2 buffers are needed to capture, got {}",
        count
    );
    println!("Using {} buffers", count);

    let mut mappings = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let buf = querybuf(&file, QueueType::VideoCapture, i)?;
        mappings.push(mmap(&file, buf.offset, buf.length)?);
        qbuf(&file, QueueType::VideoCapture, QBuffer::mmap(i))?;
    }

    streamon(&file, QueueType::VideoCapture)?;

    let irq_stop = Arc::new(AtomicBool::new(false));
    let irq_thread = {
        let dss = dss.clone();
        let irq_stop = irq_stop.clone();
        thread::spawn(move || {
            while !irq_stop.load(Ordering::SeqCst) {
                thread::sleep(interval);
                dss.frame_done();
            }
        })
    };

    let mut captured = 0;
    while captured < stop_after && !lets_quit.load(Ordering::SeqCst) {
        let buf = match dqbuf(&file, QueueType::VideoCapture) {
            Ok(buf) => buf,
            Err(DQBufError::NotReady) => {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let phys = mappings
            .get(buf.index)
            .and_then(|m| m.phys_addr(0))
            .unwrap_or(0);
        println!(
            "Frame {:4}: buffer {} at 0x{:08x}, {} bytes, timestamp {}",
            buf.sequence, buf.index, phys, buf.bytesused, buf.timestamp
        );
        captured += 1;
        qbuf(&file, QueueType::VideoCapture, QBuffer::mmap(buf.index))?;
    }

    streamoff(&file, QueueType::VideoCapture)?;
    irq_stop.store(true, Ordering::SeqCst);
    irq_thread
        .join()
        .map_err(|_| anyhow!("interrupt thread panicked"))?;

    let stats = device.pipeline_stats();
    println!(
        "Captured {} frames: {} interrupts, {} frames programmed, {} failures",
        stats.frames_done, stats.interrupts, stats.programmed, stats.program_failures
    );

    drop(mappings);
    drop(file);
    driver.remove();
    ensure!(tiler.live_blocks() == 0, "TILER memory leaked");

    Ok(())
}
