use crate::{BoardBuffer, FileOutputThreadController, OutputState};
use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Appends raw readout words to a run file, little-endian.
pub struct RawWriter {
    pub path: PathBuf,
    file: BufWriter<File>,
    pub words_written: u64,
}

impl RawWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)
            .with_context(|| format!("creating run file {}", path.display()))?;
        Ok(Self {
            path,
            file: BufWriter::new(file),
            words_written: 0,
        })
    }

    pub fn append(&mut self, words: &[u32]) -> Result<()> {
        for word in words {
            self.file.write_all(&word.to_le_bytes())?;
        }
        self.words_written += words.len() as u64;
        Ok(())
    }

    /// Flushes and closes the file, returning the number of words written.
    pub fn finish(mut self) -> Result<u64> {
        self.file
            .flush()
            .with_context(|| format!("flushing {}", self.path.display()))?;
        Ok(self.words_written)
    }
}

pub fn run_file_path(output_dir: &Path, title: &str, number: i32) -> PathBuf {
    output_dir.join(format!("{title}_run{number}.dat"))
}

fn close_run(writer: &mut Option<RawWriter>) -> Result<()> {
    if let Some(w) = writer.take() {
        let path = w.path.clone();
        let words = w.finish()?;
        info!("Closed {} ({} words)", path.display(), words);
    }
    Ok(())
}

/// Output worker: follows the controller state, writing filled buffers while
/// in `Writing` and handing every buffer back through `free_tx`.
pub fn run_output_worker(
    controller: Arc<FileOutputThreadController>,
    filled_rx: Receiver<BoardBuffer>,
    free_tx: Sender<BoardBuffer>,
    output_dir: PathBuf,
) -> Result<()> {
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating output directory {}", output_dir.display()))?;

    let mut run: Option<(String, i32)> = None;
    let mut writer: Option<RawWriter> = None;
    let mut state = controller.get_current_state();

    loop {
        match state {
            OutputState::NewRunParams => {
                let (title, number) = controller.get_new_run_params();
                debug!("Output worker: next run {title} #{number}");
                run = Some((title, number));
                state = controller.get_current_state();
            }
            OutputState::Writing => {
                if writer.is_none() {
                    let (title, number) = run.clone().unwrap_or_else(|| ("run".to_string(), 0));
                    let path = run_file_path(&output_dir, &title, number);
                    info!("Writing {}", path.display());
                    writer = Some(RawWriter::create(path)?);
                    controller.acknowledge_start();
                }
                match filled_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(mut buffer) => {
                        if let Some(w) = writer.as_mut() {
                            w.append(buffer.data())?;
                        }
                        buffer.clear();
                        // the acquisition side may already be gone
                        let _ = free_tx.send(buffer);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        warn!("Output worker: acquisition side disconnected while writing");
                        close_run(&mut writer)?;
                        controller.set_thread_done();
                        return Ok(());
                    }
                }
                state = controller.get_current_state();
            }
            OutputState::Waiting => {
                // buffers filled after the last write still belong to the run
                while let Ok(mut buffer) = filled_rx.try_recv() {
                    if let Some(w) = writer.as_mut() {
                        w.append(buffer.data())?;
                    }
                    buffer.clear();
                    let _ = free_tx.send(buffer);
                }
                close_run(&mut writer)?;
                controller.acknowledge_stop();
                state = controller.wait_for_new_state();
            }
            OutputState::Terminate => {
                close_run(&mut writer)?;
                controller.set_thread_done();
                debug!("Output worker: done");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::thread;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("orchid_{}_{}", name, std::process::id()))
    }

    #[test]
    fn words_are_little_endian() {
        let dir = temp_dir("raw_writer");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("a.dat");
        let mut writer = RawWriter::create(&path).unwrap();
        writer.append(&[0x0403_0201, 0xA000_0002]).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let bytes = std::fs::read(&path).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4, 2, 0, 0, 0xA0]);
    }

    #[test]
    fn worker_writes_one_file_per_run() {
        let dir = temp_dir("worker");
        let controller = Arc::new(FileOutputThreadController::new());
        let (filled_tx, filled_rx) = unbounded();
        let (free_tx, free_rx) = unbounded();
        let worker = {
            let controller = Arc::clone(&controller);
            let dir = dir.clone();
            thread::spawn(move || run_output_worker(controller, filled_rx, free_tx, dir))
        };

        let wait_until = |condition: &dyn Fn() -> bool| {
            for _ in 0..500 {
                if condition() {
                    return;
                }
                thread::sleep(Duration::from_millis(2));
            }
            panic!("condition not reached");
        };

        for number in [3, 4] {
            wait_until(&|| controller.set_new_run_parameters("test", number));
            wait_until(&|| controller.has_read_params());
            controller.set_to_writing();
            wait_until(&|| controller.is_running());

            let mut buffer = BoardBuffer::new(0, 4);
            buffer.words.copy_from_slice(&[number as u32, 1, 2, 3]);
            buffer.len = 2;
            filled_tx.send(buffer).unwrap();
            let returned = free_rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(returned.len, 0);

            controller.set_to_waiting();
            wait_until(&|| controller.is_waiting());
        }
        controller.set_to_terminate();
        worker.join().unwrap().unwrap();
        assert!(controller.is_done());

        let run3 = std::fs::read(run_file_path(&dir, "test", 3)).unwrap();
        let run4 = std::fs::read(run_file_path(&dir, "test", 4)).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
        assert_eq!(run3, vec![3, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(run4, vec![4, 0, 0, 0, 1, 0, 0, 0]);
    }
}
