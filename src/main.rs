use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, tick, Receiver, RecvTimeoutError, Sender};
use log::{error, info, warn, LevelFilter};
use orchid_daq::*;
use simplelog::{
    ColorChoice, CombinedLogger, Config as LogConfig, TermLogger, TerminalMode, WriteLogger,
};
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use time::OffsetDateTime;

#[derive(Parser, Debug)]
#[command(version, about = "Acquisition for a V1730 digitizer running DPP-PSD firmware")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Run against a simulated board instead of the CAENComm link
    #[arg(long)]
    simulate: bool,

    /// Run title, overriding the configuration
    #[arg(long)]
    title: Option<String>,

    #[arg(long)]
    run_number: Option<i32>,

    /// Run length in seconds
    #[arg(long)]
    duration: Option<u64>,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Channels to pulse at 1 kHz, 10 kHz, 100 kHz and 1 MHz
    #[arg(long, num_args = 4, value_names = ["1KHZ", "10KHZ", "100KHZ", "1MHZ"])]
    pulser: Option<Vec<u32>>,
}

fn init_logging(log_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let stamp = OffsetDateTime::now_utc().unix_timestamp();
    let log_file = File::create(log_dir.join(format!("orchid_daq_{stamp}.log")))?;
    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Info,
            LogConfig::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Debug, LogConfig::default(), log_file),
    ])?;
    Ok(())
}

#[cfg(feature = "caencomm")]
fn hardware_transport() -> Result<Box<dyn Transport + Send>> {
    Ok(Box::new(CaenComm))
}

#[cfg(not(feature = "caencomm"))]
fn hardware_transport() -> Result<Box<dyn Transport + Send>> {
    bail!("built without the `caencomm` feature; rerun with --simulate")
}

fn wait_for(what: &str, timeout: Duration, condition: impl Fn() -> bool) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() > deadline {
            bail!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

/// Hands the run to the output worker and waits until its file is open.
fn begin_output(controller: &FileOutputThreadController, title: &str, number: i32) -> Result<()> {
    let timeout = Duration::from_secs(5);
    wait_for("the output worker to go idle", timeout, || {
        controller.set_new_run_parameters(title, number)
    })?;
    wait_for("the output worker to take the run parameters", timeout, || {
        controller.has_read_params()
    })?;
    controller.set_to_writing();
    wait_for("the output worker to open the run file", timeout, || {
        controller.is_running()
    })
}

fn acquisition_loop<T: Transport>(
    mut dig: Vx1730Digitizer<'_, T>,
    shutdown: &AtomicBool,
    free_rx: Receiver<BoardBuffer>,
    filled_tx: Sender<BoardBuffer>,
) -> Result<Counter> {
    let mut counter = Counter::new();
    let ticker = tick(Duration::from_secs(1));
    let mut spare: Option<BoardBuffer> = None;

    dig.start_acquisition()?;
    while !shutdown.load(Ordering::SeqCst) {
        let mut buffer = match spare.take() {
            Some(buffer) => buffer,
            None => match free_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(buffer) => buffer,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("No free read buffer, the writer is falling behind");
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => bail!("output worker went away"),
            },
        };
        match dig.try_get_data(&mut buffer.words)? {
            Some(words) => {
                buffer.len = words;
                counter.increment(buffer.size_in_bytes());
                filled_tx.send(buffer).context("handing a buffer to the writer")?;
            }
            None => spare = Some(buffer),
        }

        if ticker.try_recv().is_ok() {
            let stats = dig.interrupt_stats();
            info!(
                "Time (s): {} Reads: {} Rate (MB/s): {:.2} IRQ waits: {} timeouts: {}",
                counter.t_begin.elapsed().as_secs(),
                counter.n_reads,
                counter.rate(),
                stats.attempts,
                stats.timeouts
            );
        }
    }
    dig.stop_acquisition()?;

    loop {
        let mut buffer = match spare.take() {
            Some(buffer) => buffer,
            None => free_rx
                .recv_timeout(Duration::from_secs(1))
                .context("waiting for a buffer for the final readout")?,
        };
        let words = dig.perform_final_readout(&mut buffer.words)?;
        if words == 0 {
            break;
        }
        buffer.len = words;
        counter.increment(buffer.size_in_bytes());
        filled_tx.send(buffer).context("handing a buffer to the writer")?;
    }
    info!(
        "Acquisition done: {} reads, {} bytes, {:.2} MB/s average",
        counter.n_reads,
        counter.total_size,
        counter.average_rate()
    );
    Ok(counter)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_dir)?;

    let mut conf = Conf::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(title) = args.title {
        conf.run_settings.title = title;
    }
    if let Some(number) = args.run_number {
        conf.run_settings.run_number = number;
    }
    if let Some(duration) = args.duration {
        conf.run_settings.run_duration = duration;
    }
    if conf.digitizer.channels.is_empty() {
        info!("No channel settings given, using defaults for all {CHANNELS_PER_BOARD} channels");
        conf.digitizer.channels = vec![ChannelConfig::default(); CHANNELS_PER_BOARD];
    }
    conf.run_settings.buffer_count = conf.run_settings.buffer_count.max(1);
    let run = conf.run_settings.clone();
    let module_number = conf.digitizer.module_number;
    let module = &conf.digitizer.module;
    let channels = &conf.digitizer.channels;

    let (transport, simulated): (Box<dyn Transport + Send>, Option<sim::SimulatedBoard>) =
        if args.simulate {
            let board = sim::SimulatedBoard::new();
            (Box::new(board.clone()), Some(board))
        } else {
            (hardware_transport()?, None)
        };

    let mut dig = Vx1730Digitizer::new(module_number, transport, module, channels);
    dig.setup_digitizer()?;
    dig.log_register_dump()?;
    if let Some(counts) = args.pulser.as_deref() {
        let mut pulser = PulserSetting::default();
        pulser.distribute_rates(counts[0], counts[1], counts[2], counts[3])?;
        dig.setup_pulsing(&pulser)?;
    }
    if let Some(board) = &simulated {
        let sizes = dig.readout_sizes();
        board.start_generator(
            OffsetDateTime::now_utc().unix_timestamp() as u64,
            codec::BOARD_HEADER_WORDS,
            sizes.board_aggregate_words,
            Duration::from_millis(5),
        );
    }
    info!(
        "Module {} (channels {}..{}) ready, read buffer {} words",
        dig.get_module_number(),
        dig.get_module_start_channel(),
        dig.get_module_start_channel() + CHANNELS_PER_BOARD,
        dig.get_size_of_read_buffer_in_32bit_ints()
    );

    let controller = Arc::new(FileOutputThreadController::new());
    let shutdown = AtomicBool::new(false);
    let (free_tx, free_rx) = bounded(run.buffer_count);
    let (filled_tx, filled_rx) = bounded(run.buffer_count);
    for buffer in buffer_pool(
        module_number,
        run.buffer_count,
        dig.get_size_of_read_buffer_in_32bit_ints(),
    ) {
        free_tx.send(buffer)?;
    }

    thread::scope(|s| -> Result<()> {
        let writer = {
            let controller = Arc::clone(&controller);
            let output_dir = run.output_dir.clone();
            s.spawn(move || run_output_worker(controller, filled_rx, free_tx, output_dir))
        };

        let acquisition = match begin_output(&controller, &run.title, run.run_number) {
            Ok(()) => {
                let shutdown = &shutdown;
                Some(s.spawn(move || acquisition_loop(dig, shutdown, free_rx, filled_tx)))
            }
            Err(e) => {
                error!("{e:#}");
                None
            }
        };

        if let Some(acquisition) = acquisition.as_ref() {
            info!(
                "Run {} #{} started for {} s",
                run.title, run.run_number, run.run_duration
            );
            let ticker = tick(Duration::from_millis(100));
            let t_begin = Instant::now();
            while t_begin.elapsed() < Duration::from_secs(run.run_duration)
                && !acquisition.is_finished()
            {
                let _ = ticker.recv();
            }
        }
        shutdown.store(true, Ordering::SeqCst);
        let acquired = acquisition.map(|handle| match handle.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("acquisition thread panicked")),
        });

        controller.set_to_waiting();
        let closed = wait_for("the output worker to close the run file", Duration::from_secs(5), || {
            controller.is_waiting()
        });
        if let Err(e) = closed {
            warn!("{e:#}");
        }
        controller.set_to_terminate();
        match writer.join() {
            Ok(result) => result.context("output worker")?,
            Err(_) => bail!("output worker panicked"),
        }

        match acquired {
            Some(result) => {
                result?;
                info!("Run {} #{} complete", run.title, run.run_number);
                Ok(())
            }
            None => bail!("run {} #{} never started", run.title, run.run_number),
        }
    })
}
