// tests/ring_protocol.rs
//
// Protocol-level tests against small rings, where wraps and backpressure
// happen within a handful of commands. The device side is either played
// manually through the register file or by the in-process simulator.

use std::sync::Arc;
use std::time::Duration;

use spindle::command::{CommandHeader, CommandKind, COMPLETION_HEADER_BYTES};
use spindle::layout::QueueLayout;
use spindle::ring::Cursor;
use spindle::sim::{SimDevice, SimOptions};
use spindle::sysmem::{queue_layouts, DispatchMetrics, SysmemConfig, SysmemManager};
use spindle::{
    ConfigError, DeviceId, DispatchError, PollBudget, QueueId, RegisterFile, WaitError,
};

const Q: QueueId = QueueId::new(0);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 512 B region: 96 B header, 256 B issue ring (16 words), 160 B completion
/// ring (10 words).
fn small_config(deadline: Option<Duration>) -> SysmemConfig {
    let mut budget = PollBudget::unbounded();
    if let Some(deadline) = deadline {
        budget = budget.with_deadline(deadline);
    }
    SysmemConfig {
        num_queues: 1,
        queue_region_size: 512,
        issue_fraction: 0.6,
        budget,
    }
}

fn small_manager(
    deadline: Option<Duration>,
) -> (Arc<SysmemManager>, Arc<RegisterFile>, QueueLayout) {
    init_tracing();
    let config = small_config(deadline);
    let layouts = queue_layouts(&config).unwrap();
    let regs = Arc::new(RegisterFile::new(&layouts));
    let metrics = Arc::new(DispatchMetrics::new());
    let manager = Arc::new(
        SysmemManager::new_with_metrics(DeviceId::new(0), config, regs.clone(), metrics).unwrap(),
    );
    (manager, regs, layouts[0])
}

#[test]
fn command_larger_than_the_issue_ring_is_rejected() {
    let (manager, _regs, _layout) = small_manager(None);
    let header = CommandHeader::new(CommandKind::WriteBuffer, 1, 300, 0);
    let err = manager
        .write_then_push(Q, &header, &[0u8; 300], false)
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Config(ConfigError::OversizedCommand {
            requested: 332,
            capacity: 256,
        })
    ));
}

#[test]
fn full_ring_blocks_then_wraps_after_the_device_drains() {
    let (manager, regs, layout) = small_manager(Some(Duration::from_millis(20)));
    let span = layout.issue_span();

    // A: 64 B on the ring (4 words).
    let a = CommandHeader::new(CommandKind::WriteBuffer, 1, 32, 0);
    manager.write_then_push(Q, &a, &[0x11; 32], false).unwrap();
    assert_eq!(
        Cursor::from_packed(regs.device_issue_write_ptr(Q)).pos(),
        span.start() + 4
    );

    // B: 224 B. Only 192 B remain before the limit, so the push plants a
    // wrap marker and then blocks: the pre-wrap lap is still unread.
    let b = CommandHeader::new(CommandKind::WriteBuffer, 2, 192, 0);
    let err = manager
        .write_then_push(Q, &b, &[0x22; 192], false)
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Wait(WaitError::DeadlineExceeded { .. })
    ));
    let posted = Cursor::from_packed(regs.device_issue_write_ptr(Q));
    assert_eq!(posted.pos(), span.start());
    assert!(posted.parity(), "rewrap must flip the toggle");

    // Play the device: consume A, then honor the wrap marker.
    let window = manager.window();
    let mut read = Cursor::at_start(span);
    let header = CommandHeader::decode(&window.read_vec(read.byte_offset(), 32)).unwrap();
    assert_eq!(header.kind, CommandKind::WriteBuffer);
    assert_eq!(header.seq, 1);
    read.advance(4, span);
    regs.device_publish_issue_read(Q, read.packed());

    let header = CommandHeader::decode(&window.read_vec(read.byte_offset(), 32)).unwrap();
    assert_eq!(header.kind, CommandKind::Wrap);
    read.rewrap(span);
    regs.device_publish_issue_read(Q, read.packed());

    // The retry starts from the region base and fits without a new marker.
    manager.write_then_push(Q, &b, &[0x22; 192], false).unwrap();
    let posted = Cursor::from_packed(regs.device_issue_write_ptr(Q));
    assert_eq!(posted.pos(), span.start() + 14);
    assert!(posted.parity());

    let metrics = manager.metrics().unwrap();
    assert_eq!(metrics.issue_wraps(), 1);
    assert_eq!(metrics.commands_pushed(), 2);
}

#[test]
fn completions_stay_fifo_across_many_wraps() {
    let (manager, regs, layout) = small_manager(None);
    let _sim = SimDevice::spawn(
        DeviceId::new(0),
        manager.window().clone(),
        regs,
        vec![layout],
        Some(manager.fault_reporter()),
        SimOptions::default(),
    );

    // 96 B commands and 64 B completion records: both rings wrap several
    // times over 24 commands. At most two completions are left outstanding
    // so the 160 B completion ring never deadlocks the device.
    let payload = [0x5a; 64];
    let mut expect = Vec::new();
    for seq in 1..=24u64 {
        let header = CommandHeader::new(
            CommandKind::WriteBuffer,
            seq,
            payload.len() as u32,
            COMPLETION_HEADER_BYTES + 32,
        );
        manager.write_then_push(Q, &header, &payload, false).unwrap();
        expect.push(seq);
        if expect.len() == 2 {
            for want in expect.drain(..) {
                let (completion, echo) = manager.wait_and_pop(Q).unwrap();
                assert_eq!(completion.seq, want);
                assert_eq!(echo, &payload[..32]);
            }
        }
    }
    manager.synchronize(Q).unwrap();

    let metrics = manager.metrics().unwrap();
    assert_eq!(metrics.completions_popped(), 24);
    assert!(metrics.issue_wraps() >= 1, "issue ring never wrapped");
    assert!(metrics.completion_wraps() >= 1, "completion ring never wrapped");
}

#[test]
fn lazy_pushes_collapse_into_one_doorbell() {
    let (manager, regs, layout) = small_manager(None);
    let span = layout.issue_span();

    let initial = regs.device_issue_write_ptr(Q);
    for seq in 1..=3u64 {
        let header = CommandHeader::new(CommandKind::WriteBuffer, seq, 32, 0);
        manager.write_then_push(Q, &header, &[0; 32], true).unwrap();
        assert_eq!(regs.device_issue_write_ptr(Q), initial);
    }
    manager.flush(Q).unwrap();
    assert_eq!(
        Cursor::from_packed(regs.device_issue_write_ptr(Q)).pos(),
        span.start() + 12
    );

    let metrics = manager.metrics().unwrap();
    assert_eq!(metrics.lazy_pushes(), 3);
    assert_eq!(metrics.doorbells_posted(), 1);
}

#[test]
fn completion_record_larger_than_the_completion_ring_is_rejected() {
    let (manager, _regs, layout) = small_manager(None);
    assert_eq!(layout.completion_region_size(), 160);
    // The device could never find space for a 192 B record; the push must
    // fail synchronously instead of leaving both sides spinning.
    let header = CommandHeader::new(CommandKind::ReadBuffer, 1, 8, 192);
    let err = manager
        .write_then_push(Q, &header, &[0; 8], false)
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Config(ConfigError::OversizedCommand {
            requested: 192,
            capacity: 160,
        })
    ));
    // Nothing was pushed, so the queue stays usable.
    assert_eq!(manager.in_flight(Q).unwrap(), 0);
    let header = CommandHeader::new(CommandKind::WriteBuffer, 2, 32, 0);
    manager.write_then_push(Q, &header, &[0; 32], false).unwrap();
}

#[test]
fn a_drain_posts_the_doorbell_for_an_open_lazy_batch() {
    let (manager, regs, layout) = small_manager(None);
    let initial = regs.device_issue_write_ptr(Q);
    let _sim = SimDevice::spawn(
        DeviceId::new(0),
        manager.window().clone(),
        regs.clone(),
        vec![layout],
        Some(manager.fault_reporter()),
        SimOptions::default(),
    );

    let header = CommandHeader::new(CommandKind::Barrier, 1, 0, COMPLETION_HEADER_BYTES);
    manager.write_then_push(Q, &header, &[], true).unwrap();
    assert_eq!(
        regs.device_issue_write_ptr(Q),
        initial,
        "lazy push must not ring the doorbell"
    );

    // The drain must end the open batch itself; the device was never told
    // about the barrier.
    manager.synchronize(Q).unwrap();
    assert_eq!(manager.in_flight(Q).unwrap(), 0);
}

#[test]
fn mismatched_payload_length_is_rejected() {
    let (manager, _regs, _layout) = small_manager(None);
    let header = CommandHeader::new(CommandKind::WriteBuffer, 1, 64, 0);
    let err = manager
        .write_then_push(Q, &header, &[0; 32], false)
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Config(ConfigError::PayloadMismatch {
            declared: 64,
            actual: 32,
        })
    ));
}

#[test]
fn reconfiguration_waits_for_the_device_to_drain() {
    let (manager, regs, _layout) = small_manager(None);
    // Fire-and-forget: nothing in flight by completion count, but the ring
    // still holds an unconsumed command.
    let header = CommandHeader::new(CommandKind::WriteBuffer, 1, 32, 0);
    manager.write_then_push(Q, &header, &[0; 32], false).unwrap();
    assert_eq!(manager.in_flight(Q).unwrap(), 0);

    assert!(matches!(
        manager.reset(Q),
        Err(ConfigError::QueueDraining { .. })
    ));
    assert!(matches!(
        manager.set_issue_region_size(Q, 128),
        Err(ConfigError::QueueDraining { .. })
    ));

    // The device catches up; reconfiguration is allowed again.
    regs.device_publish_issue_read(Q, regs.device_issue_write_ptr(Q));
    manager.reset(Q).unwrap();
}

#[test]
fn resize_is_refused_while_commands_are_in_flight() {
    let (manager, _regs, _layout) = small_manager(None);
    let header = CommandHeader::new(CommandKind::Barrier, 1, 0, COMPLETION_HEADER_BYTES);
    manager.write_then_push(Q, &header, &[], false).unwrap();

    let err = manager.set_issue_region_size(Q, 128).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::QueueBusy { in_flight: 1, .. }
    ));
    assert!(matches!(
        manager.reset(Q),
        Err(ConfigError::QueueBusy { .. })
    ));
}

#[test]
fn idle_resize_recomputes_both_regions() {
    let (manager, _regs, _layout) = small_manager(None);
    manager.set_issue_region_size(Q, 128).unwrap();
    assert_eq!(manager.issue_region_size(Q).unwrap(), 128);
    assert_eq!(manager.completion_region_size(Q).unwrap(), 512 - 96 - 128);
    // Degenerate splits keep the old layout.
    assert!(manager.set_issue_region_size(Q, 0).is_err());
    assert!(manager.set_issue_region_size(Q, 512).is_err());
    assert_eq!(manager.issue_region_size(Q).unwrap(), 128);
}
