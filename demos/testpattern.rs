use std::{
    error::Error,
    os::unix::io::{AsFd, OwnedFd},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use calloop::{channel, EventLoop};
use clap::Parser;
use drm::{
    buffer::{Buffer, DrmFourcc},
    control::{dumbbuffer::DumbBuffer, Device as ControlDevice},
};
use kms_sink::{
    buffer::{BufferId, FrameBuffer, FramePlane},
    device::drm::{DrmCard, DrmDisplay},
    scheduler::FrameStatus,
    sink::{KmsSink, StreamConfig},
    utils::Size,
    Fourcc,
};
use smallvec::{smallvec, SmallVec};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Scroll color bars across a display", long_about = None)]
struct Cli {
    /// DRM device node
    #[arg(short, long, default_value = "/dev/dri/card0")]
    device: PathBuf,
    /// Connector to display on, e.g. HDMI-A-1
    #[arg(short, long)]
    connector: Option<String>,
    #[arg(long, default_value_t = 1920)]
    width: u32,
    #[arg(long, default_value_t = 1080)]
    height: u32,
    /// Number of frames to display
    #[arg(short, long, default_value_t = 300)]
    frames: u64,
    /// Number of buffers cycling between producer and display
    #[arg(short, long, default_value_t = 3)]
    buffers: u64,
}

struct PatternBuffer {
    id: BufferId,
    dumb: DumbBuffer,
    fd: OwnedFd,
    length: u32,
}

impl FrameBuffer for PatternBuffer {
    fn id(&self) -> BufferId {
        self.id
    }

    fn planes(&self) -> SmallVec<[FramePlane<'_>; 4]> {
        smallvec![FramePlane {
            fd: self.fd.as_fd(),
            offset: 0,
            length: self.length,
        }]
    }
}

const BARS: [[u8; 4]; 8] = [
    [0xff, 0xff, 0xff, 0xff],
    [0x00, 0xff, 0xff, 0xff],
    [0xff, 0xff, 0x00, 0xff],
    [0x00, 0xff, 0x00, 0xff],
    [0xff, 0x00, 0xff, 0xff],
    [0x00, 0x00, 0xff, 0xff],
    [0xff, 0x00, 0x00, 0xff],
    [0x00, 0x00, 0x00, 0xff],
];

fn allocate(card: &DrmCard, id: u64, size: Size) -> Result<PatternBuffer, Box<dyn Error>> {
    let dumb = card.create_dumb_buffer((size.w, size.h), DrmFourcc::Xrgb8888, 32)?;
    let fd = card.buffer_to_prime_fd(dumb.handle(), drm::CLOEXEC | drm::RDWR)?;
    Ok(PatternBuffer {
        id: BufferId(id),
        length: dumb.pitch() * size.h,
        dumb,
        fd,
    })
}

fn paint(card: &DrmCard, buffer: &mut PatternBuffer, frame: u64) -> std::io::Result<()> {
    let (width, _) = buffer.dumb.size();
    let pitch = buffer.dumb.pitch() as usize;
    let bar_width = (width as usize / BARS.len()).max(1);
    let shift = (frame as usize * 8) % width as usize;

    let mut mapping = card.map_dumb_buffer(&mut buffer.dumb)?;
    for line in mapping.as_mut().chunks_exact_mut(pitch) {
        for (x, pixel) in line[..width as usize * 4].chunks_exact_mut(4).enumerate() {
            let bar = ((x + shift) % width as usize) / bar_width;
            pixel.copy_from_slice(&BARS[bar.min(BARS.len() - 1)]);
        }
    }
    Ok(())
}

struct State {
    free: Vec<PatternBuffer>,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Cli::parse();

    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().init();
    }

    let display = Arc::new(DrmDisplay::open(&args.device)?);
    let card = display.card().clone();
    let size = Size::new(args.width, args.height);

    let mut state = State {
        free: (0..args.buffers.max(2))
            .map(|id| allocate(&card, id, size))
            .collect::<Result<_, _>>()?,
    };
    let stride = state.free[0].dumb.pitch();

    let (mut sink, released) = KmsSink::new(display.clone(), args.connector.as_deref())?;
    sink.configure(&StreamConfig {
        format: Fourcc::Xrgb8888,
        size,
        stride,
    })?;
    sink.start()?;
    info!(connector = sink.connector().name(), "Displaying {} frames", args.frames);

    let mut event_loop = EventLoop::<State>::try_new()?;
    let completion = sink.completion_handle();
    event_loop
        .handle()
        .insert_source(display.event_source(), move |event, _, _| {
            if let Err(err) = completion.on_event(event) {
                error!("{}", err);
            }
        })
        .map_err(|err| err.error)?;
    event_loop
        .handle()
        .insert_source(released, |event, _, state: &mut State| {
            if let channel::Event::Msg(buffer) = event {
                state.free.push(buffer);
            }
        })
        .map_err(|err| err.error)?;

    let mut frame = 0;
    while frame < args.frames {
        if sink.slots().pending.is_none() {
            if let Some(mut buffer) = state.free.pop() {
                paint(&card, &mut buffer, frame)?;
                match sink.submit_frame(buffer) {
                    Ok(FrameStatus::Dropped(buffer)) => state.free.push(buffer),
                    Ok(_) => frame += 1,
                    Err(err) => {
                        let (buffer, err) = err.into_parts();
                        warn!("Frame {} not displayed: {}", frame, err);
                        state.free.push(buffer);
                    }
                }
            }
        }
        event_loop.dispatch(Some(Duration::from_millis(16)), &mut state)?;
    }

    sink.stop()?;
    for buffer in state.free {
        card.destroy_dumb_buffer(buffer.dumb)?;
    }
    Ok(())
}
