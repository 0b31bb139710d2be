//! This example program pumps generated frames through a queue, with the
//! producer and the consumer running on different threads.
//!
//! The producer fills each buffer with a moving pattern, and the consumer
//! checks that frames arrive in order before releasing them.
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, ensure, Context};
use bufferqueue::fence::Fence;
use bufferqueue::graphic_buffer::GraphicBuffer;
use bufferqueue::memory::MemfdAllocator;
use bufferqueue::queue::*;
use bufferqueue::{Error, PixelFormat, ProducerApi, Usage};
use bufferqueue_utils::framegen::FrameGenerator;
use clap::{Arg, Command};

const FENCE_TIMEOUT: Duration = Duration::from_secs(1);

/// Wakes the consumer loop up when frames are queued.
#[derive(Default)]
struct FrameListener {
    available: Mutex<usize>,
    cond: Condvar,
}

impl FrameListener {
    /// Waits until a frame is available or `timeout` expires.
    fn wait_frame(&self, timeout: Duration) {
        let available = self.available.lock().unwrap();
        let (mut available, _) = self
            .cond
            .wait_timeout_while(available, timeout, |a| *a == 0)
            .unwrap();
        *available = available.saturating_sub(1);
    }
}

impl ConsumerListener for FrameListener {
    fn on_frame_available(&self, _item: &BufferItem) {
        *self.available.lock().unwrap() += 1;
        self.cond.notify_one();
    }

    fn on_disconnect(&self) {
        log::info!("Producer disconnected");
    }
}

/// Produces frames until `stop_after` frames have been queued or `lets_quit`
/// is set. The producer must be connected.
fn run_producer(
    producer: &BufferQueueProducer,
    lets_quit: &AtomicBool,
    stop_after: Option<usize>,
) -> anyhow::Result<()> {
    let mut buffers: [Option<Arc<GraphicBuffer>>; NUM_BUFFER_SLOTS] = Default::default();
    let mut generator: Option<FrameGenerator> = None;
    let mut frame_counter = 0usize;

    while !lets_quit.load(Ordering::SeqCst) {
        if let Some(max) = stop_after {
            if frame_counter >= max {
                break;
            }
        }

        let dequeued = match producer.dequeue_buffer(
            0,
            0,
            PixelFormat::default(),
            Usage::CPU_WRITE_OFTEN,
            false,
        ) {
            Ok(dequeued) => dequeued,
            Err(Error::NoInit) => break,
            Err(e) => return Err(e).context("while dequeueing a buffer"),
        };
        let slot = dequeued.slot;

        if dequeued.flags.contains(DequeueFlags::RELEASE_ALL_BUFFERS) {
            buffers.iter_mut().for_each(|b| *b = None);
        }
        if dequeued
            .flags
            .contains(DequeueFlags::BUFFER_NEEDS_REALLOCATION)
        {
            let buffer = producer.request_buffer(slot)?;
            // All buffers share the same layout.
            if generator.is_none() {
                generator = Some(FrameGenerator::for_buffer(&buffer)?);
            }
            buffers[slot] = Some(buffer);
        }

        let buffer = buffers[slot]
            .as_ref()
            .ok_or_else(|| anyhow!("no buffer cached for slot {}", slot))?;
        let generator = generator
            .as_mut()
            .ok_or_else(|| anyhow!("no frame generator"))?;

        dequeued
            .fence
            .wait(FENCE_TIMEOUT)
            .context("while waiting for the release fence")?;
        generator.next_frame(&mut buffer.map()?)?;

        producer.queue_buffer(slot, QueueBufferInput::new(Fence::NO_FENCE))?;
        frame_counter += 1;
    }

    Ok(())
}

fn main() {
    env_logger::init();

    let matches = Command::new("BufferQueue frame pump")
        .arg(
            Arg::new("num_frames")
                .long("stop_after")
                .takes_value(true)
                .help("Stop after producing this number of frames"),
        )
        .arg(
            Arg::new("frame_size")
                .long("frame_size")
                .required(false)
                .takes_value(true)
                .default_value("640x480")
                .help("Size of the frames to produce (e.g. \"640x480\")"),
        )
        .arg(
            Arg::new("max_acquired")
                .long("max_acquired")
                .takes_value(true)
                .default_value("1")
                .help("Number of frames the consumer can hold at the same time"),
        )
        .arg(
            Arg::new("async")
                .long("async")
                .help("Let the producer replace frames the consumer has not acquired yet"),
        )
        .arg(
            Arg::new("output_file")
                .long("save")
                .required(false)
                .takes_value(true)
                .help("Save the consumed frames to a file"),
        )
        .get_matches();

    let stop_after = matches
        .value_of("num_frames")
        .map(|v| v.parse::<usize>().expect("Invalid value for stop_after"));
    let frame_size = matches
        .value_of("frame_size")
        .map(|s| {
            const ERROR_MSG: &str = "Invalid parameter for frame_size";
            let split: Vec<&str> = s.split('x').collect();
            if split.len() != 2 {
                panic!("{}", ERROR_MSG);
            }
            let width: u32 = split[0].parse().expect(ERROR_MSG);
            let height: u32 = split[1].parse().expect(ERROR_MSG);
            (width, height)
        })
        .unwrap();
    let max_acquired: usize = matches
        .value_of("max_acquired")
        .map(|v| v.parse().expect("Invalid value for max_acquired"))
        .unwrap();
    let async_mode = matches.is_present("async");

    let mut output_file = matches
        .value_of("output_file")
        .map(|s| File::create(s).expect("Invalid output file specified."));

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .expect("Failed to set Ctrl-C handler.");
    }

    let config = BufferQueueConfig::new()
        .consumer_name("frame_pump")
        .default_size(frame_size.0, frame_size.1)
        .default_format(PixelFormat::RGBA_8888)
        .max_acquired_buffers(max_acquired);
    let (producer, consumer) = BufferQueue::with_config(Arc::new(MemfdAllocator::new()), config)
        .expect("Invalid queue configuration");

    let listener = Arc::new(FrameListener::default());
    consumer
        .consumer_connect(&listener, false)
        .expect("Failed to connect consumer");
    producer
        .set_async_mode(async_mode)
        .expect("Failed to set async mode");

    println!(
        "Producing {}x{} {} frames",
        frame_size.0,
        frame_size.1,
        PixelFormat::RGBA_8888
    );

    producer
        .connect(ProducerApi::Cpu, false, None)
        .expect("Failed to connect producer");
    let producer_done = AtomicBool::new(false);

    let frame_counter = thread::scope(|s| {
        let producer_thread = s.spawn(|| {
            let res = run_producer(&producer, &lets_quit, stop_after);
            producer_done.store(true, Ordering::SeqCst);
            res
        });

        let frame_counter = consume_frames(
            &consumer,
            &listener,
            &producer_done,
            async_mode,
            &mut output_file,
        );

        match producer_thread.join() {
            Ok(Ok(())) => (),
            Ok(Err(e)) => panic!("Producer failed: {:#}", e),
            Err(_) => panic!("Producer thread panicked"),
        }
        frame_counter
    });

    // Only disconnect once every frame has been consumed, as disconnecting
    // drops the queued ones.
    producer
        .disconnect(ProducerApi::Cpu)
        .expect("Failed to disconnect producer");
    consumer
        .consumer_disconnect()
        .expect("Failed to disconnect consumer");
    log::debug!("{}", consumer.dump_state("  "));

    ensure_all_consumed(frame_counter, stop_after, async_mode).expect("Frames were lost");
}

fn ensure_all_consumed(
    consumed: usize,
    stop_after: Option<usize>,
    async_mode: bool,
) -> anyhow::Result<()> {
    if let (Some(expected), false) = (stop_after, async_mode) {
        ensure!(
            consumed == expected,
            "consumed {} frames, expected {}",
            consumed,
            expected
        );
    }
    Ok(())
}

/// Acquires and checks frames until the producer is done and the queue is
/// empty. Returns the number of frames consumed.
fn consume_frames(
    consumer: &BufferQueueConsumer,
    listener: &FrameListener,
    producer_done: &AtomicBool,
    async_mode: bool,
    output_file: &mut Option<File>,
) -> usize {
    let mut buffers: [Option<Arc<GraphicBuffer>>; NUM_BUFFER_SLOTS] = Default::default();
    let mut frame_counter = 0usize;
    let mut last_step = None;
    let start_time = Instant::now();

    loop {
        // Checked before acquiring, so the last frame is not missed.
        let done = producer_done.load(Ordering::SeqCst);
        let item = match consumer.acquire_buffer(0, 0) {
            Ok(item) => item,
            Err(Error::NoBufferAvailable) if done => break,
            Err(Error::NoBufferAvailable) => {
                listener.wait_frame(Duration::from_millis(100));
                continue;
            }
            Err(e) => panic!("Failed to acquire buffer: {}", e),
        };

        if let Some(buffer) = &item.graphic_buffer {
            buffers[item.slot] = Some(Arc::clone(buffer));
        }
        let buffer = buffers[item.slot]
            .as_ref()
            .expect("Acquired a slot without a known buffer");

        item.fence
            .wait(FENCE_TIMEOUT)
            .expect("Error while waiting for the acquire fence");
        let mapping = buffer.map().expect("Failed to map buffer");
        let step = FrameGenerator::frame_step(&mapping).expect("Frame is too small");
        if let Some(last) = last_step {
            if !async_mode && step != last + 1 {
                panic!("Frame {} received after frame {}", step, last);
            }
        }
        last_step = Some(step);

        if let Some(output) = output_file {
            output
                .write_all(&mapping)
                .expect("Error while writing output data");
        }
        drop(mapping);

        consumer
            .release_buffer(item.slot, item.frame_number, Fence::NO_FENCE)
            .expect("Failed to release buffer");

        frame_counter += 1;
        let elapsed = start_time.elapsed();
        let fps = frame_counter as f32 / elapsed.as_millis().max(1) as f32 * 1000.0;
        print!(
            "\rConsumed frame {:#5}, slot: {:#2}, fps: {:#5.2}",
            item.frame_number, item.slot, fps
        );
        std::io::stdout().flush().unwrap();
    }
    println!();

    frame_counter
}
