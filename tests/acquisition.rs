use crossbeam_channel::unbounded;
use orchid_daq::registers::{ACQUISITION_CONTROL, AC_RUN};
use orchid_daq::sim::SimulatedBoard;
use orchid_daq::*;
use std::{sync::Arc, thread, time::Duration};

fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("condition not reached");
}

#[test]
fn simulated_run_lands_in_the_run_file() {
    let out_dir = std::env::temp_dir().join(format!("orchid_it_{}", std::process::id()));
    let module = ModuleConfig {
        aggregates_per_blt: 4,
        ..ModuleConfig::default()
    };
    let channels = vec![ChannelConfig::default(); CHANNELS_PER_BOARD];

    let board = SimulatedBoard::new();
    let mut dig = Vx1730Digitizer::new(0, board.clone(), &module, &channels)
        .with_settle_times(SettleTimes::none())
        .with_irq_timeout(5);
    dig.setup_digitizer().unwrap();

    let controller = Arc::new(FileOutputThreadController::new());
    let (filled_tx, filled_rx) = unbounded();
    let (free_tx, free_rx) = unbounded();
    for buffer in buffer_pool(0, 4, dig.get_size_of_read_buffer_in_32bit_ints()) {
        free_tx.send(buffer).unwrap();
    }
    let writer = {
        let controller = Arc::clone(&controller);
        let out_dir = out_dir.clone();
        thread::spawn(move || run_output_worker(controller, filled_rx, free_tx, out_dir))
    };

    wait_until(|| controller.set_new_run_parameters("sim", 42));
    wait_until(|| controller.has_read_params());
    controller.set_to_writing();
    wait_until(|| controller.is_running());

    dig.start_acquisition().unwrap();
    assert_ne!(board.register(ACQUISITION_CONTROL).unwrap() & AC_RUN, 0);

    let aggregates: Vec<Vec<u32>> = (0..6u32)
        .map(|i| (0..(5 + i)).map(|w| (i << 16) | w).collect())
        .collect();
    let mut expected = Vec::new();
    let mut read = 0;

    // half of the data is already waiting, half arrives with an interrupt
    for (i, aggregate) in aggregates.iter().enumerate() {
        expected.extend_from_slice(aggregate);
        if i % 2 == 0 {
            board.push_aggregate(aggregate.clone());
        } else {
            board.push_on_interrupt(aggregate.clone());
        }
        let mut buffer = free_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        buffer.len = dig.get_data(&mut buffer.words).unwrap();
        read += buffer.len;
        filled_tx.send(buffer).unwrap();
    }
    assert_eq!(read, expected.len());

    // left on the board at stop time
    let tail = vec![0xDEAD_0000, 1, 2];
    board.push_aggregate(tail.clone());
    expected.extend_from_slice(&tail);
    dig.stop_acquisition().unwrap();
    let mut buffer = free_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    buffer.len = dig.perform_final_readout(&mut buffer.words).unwrap();
    assert_eq!(buffer.len, tail.len());
    filled_tx.send(buffer).unwrap();

    let stats = dig.interrupt_stats();
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.timeouts, 0);
    drop(dig);
    assert!(!board.is_open());

    controller.set_to_waiting();
    wait_until(|| controller.is_waiting());
    controller.set_to_terminate();
    writer.join().unwrap().unwrap();
    assert!(controller.is_done());

    let bytes = std::fs::read(run_file_path(&out_dir, "sim", 42)).unwrap();
    std::fs::remove_dir_all(&out_dir).unwrap();
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    assert_eq!(words, expected);
}

#[test]
fn failed_setup_leaves_the_board_closed() {
    let module = ModuleConfig::default();
    let channels = vec![ChannelConfig::default(); CHANNELS_PER_BOARD];
    let board = SimulatedBoard::new();
    board.fail_writes_after(12);

    let mut dig = Vx1730Digitizer::new(0, board.clone(), &module, &channels)
        .with_settle_times(SettleTimes::none());
    let err = dig.setup_digitizer().unwrap_err();
    assert!(matches!(err, DaqError::HardwareComm { .. }));
    assert_eq!(dig.state(), DigitizerState::Closed);
    assert!(!board.is_open());
}
