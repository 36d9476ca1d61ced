//! Placement, transfer and mapping behaviour of compute buffers.

mod common;

use std::io::Write;

use sparkcl::{
    CommandClass, ComputeBuffer, MapFlags, MemFlags, PlacementKind, PlacementPolicy, SparkError,
};

// ── Placement ────────────────────────────────────────────────────────

#[test]
fn unified_host_and_device_is_aliased_and_transfers_are_noops() -> anyhow::Result<()> {
    let (driver, rt) = common::runtime(true);
    let buf = ComputeBuffer::from_slice(
        &rt,
        &[1u8, 2, 3],
        PlacementPolicy::HostAndDevice,
        MemFlags::READ_WRITE,
    )?;
    assert!(buf.is_aliased());
    assert_eq!(buf.placement_kind(), PlacementKind::Unified);
    assert_eq!(buf.host_handle(), buf.device_handle());
    assert_eq!(driver.stats().live_buffers, 1);

    let copies = driver.stats().copies;
    assert!(buf.to_device(true, &[])?.is_none());
    assert!(buf.to_host(false, &[])?.is_none());
    assert_eq!(driver.stats().copies, copies);
    Ok(())
}

#[test]
fn unified_device_still_checks_policy() -> anyhow::Result<()> {
    let (_, rt) = common::runtime(true);
    let device_only =
        ComputeBuffer::<f32>::new(&rt, 4, PlacementPolicy::DeviceOnly, MemFlags::READ_WRITE)?;
    assert!(matches!(device_only.to_device(true, &[]), Err(SparkError::Configuration { .. })));
    assert!(matches!(device_only.map_host(MapFlags::READ), Err(SparkError::Configuration { .. })));
    Ok(())
}

#[test]
fn split_buffer_round_trips_bit_exact() -> anyhow::Result<()> {
    let (driver, rt) = common::runtime(false);
    let data: Vec<f64> = (0..100).map(|i| f64::from(i).sqrt() * -1.0e-3).collect();
    let buf = ComputeBuffer::from_slice(&rt, &data, PlacementPolicy::HostAndDevice, MemFlags::READ_WRITE)?;
    assert_eq!(buf.placement_kind(), PlacementKind::Split);
    assert_ne!(buf.host_handle(), buf.device_handle());

    let up = buf.to_device(false, &[])?.expect("split buffers copy");
    let down = buf.to_host(true, &[&up])?.expect("split buffers copy");
    assert_eq!(down.command(), CommandClass::Compute);
    assert_eq!(driver.stats().copies, 2);

    let mut out = vec![0f64; 100];
    buf.host_read_to(&mut out)?;
    assert_eq!(
        out.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
        data.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
    );
    Ok(())
}

#[test]
fn device_writes_are_visible_after_to_host() -> anyhow::Result<()> {
    let (_, rt) = common::runtime(false);
    let buf = ComputeBuffer::<i64>::new(&rt, 3, PlacementPolicy::HostAndDevice, MemFlags::READ_WRITE)?;
    buf.device_write_from(&[7, -8, 9])?;

    let mut host = [0i64; 3];
    buf.host_read_to(&mut host)?;
    assert_eq!(host, [0, 0, 0]);

    buf.to_host(true, &[])?;
    buf.host_read_to(&mut host)?;
    assert_eq!(host, [7, -8, 9]);
    Ok(())
}

// ── Buffer-to-buffer copies ──────────────────────────────────────────

#[test]
fn copy_host_to_and_device_to_are_bit_exact() -> anyhow::Result<()> {
    let (_, rt) = common::runtime(false);
    let data: Vec<u32> = (0..64).map(|i| i * 31 + 7).collect();
    let src = ComputeBuffer::from_slice(&rt, &data, PlacementPolicy::HostAndDevice, MemFlags::READ_ONLY)?;
    let dst = ComputeBuffer::<u32>::new(&rt, 64, PlacementPolicy::HostAndDevice, MemFlags::READ_WRITE)?;

    src.copy_host_to(&dst, true, &[])?;
    let mut out = vec![0u32; 64];
    dst.host_read_to(&mut out)?;
    assert_eq!(out, data);

    src.copy_device_to(&dst, true, &[])?;
    dst.device_read_to(&mut out)?;
    assert_eq!(out, data);
    Ok(())
}

#[test]
fn copies_need_the_side_on_both_buffers() -> anyhow::Result<()> {
    let (driver, rt) = common::runtime(false);
    let host = ComputeBuffer::<f32>::new(&rt, 8, PlacementPolicy::HostOnly, MemFlags::READ_WRITE)?;
    let device = ComputeBuffer::<f32>::new(&rt, 8, PlacementPolicy::DeviceOnly, MemFlags::READ_WRITE)?;

    assert!(matches!(host.copy_host_to(&device, true, &[]), Err(SparkError::Configuration { .. })));
    assert!(matches!(host.copy_device_to(&device, true, &[]), Err(SparkError::Configuration { .. })));
    assert!(matches!(device.copy_device_to(&host, true, &[]), Err(SparkError::Configuration { .. })));
    assert_eq!(driver.stats().copies, 0);
    Ok(())
}

#[test]
fn copy_into_mapped_destination_is_rejected() -> anyhow::Result<()> {
    let (driver, rt) = common::runtime(false);
    let src = ComputeBuffer::<u8>::new(&rt, 8, PlacementPolicy::HostOnly, MemFlags::READ_WRITE)?;
    let dst = ComputeBuffer::<u8>::new(&rt, 8, PlacementPolicy::HostOnly, MemFlags::READ_WRITE)?;
    let view = dst.map_host(MapFlags::READ)?;
    assert!(matches!(src.copy_host_to(&dst, true, &[]), Err(SparkError::BufferMapped { .. })));
    drop(view);
    src.copy_host_to(&dst, true, &[])?;
    assert_eq!(driver.stats().copies, 1);
    Ok(())
}

// ── Mapping ──────────────────────────────────────────────────────────

#[test]
fn map_host_on_device_only_returns_no_accessor() -> anyhow::Result<()> {
    let (driver, rt) = common::runtime(false);
    let buf = ComputeBuffer::<f32>::new(&rt, 16, PlacementPolicy::DeviceOnly, MemFlags::READ_WRITE)?;
    let err = buf.map_host(MapFlags::READ | MapFlags::WRITE).unwrap_err();
    assert!(matches!(err, SparkError::Configuration { .. }), "{err}");
    assert!(!buf.is_mapped());
    assert_eq!(driver.stats().maps, 0);
    Ok(())
}

#[test]
fn accessor_on_unified_buffer_sees_device_data() -> anyhow::Result<()> {
    let (_, rt) = common::runtime(true);
    let buf = ComputeBuffer::<i32>::new(&rt, 4, PlacementPolicy::HostAndDevice, MemFlags::READ_WRITE)?;
    buf.device_write_from(&[4, 3, 2, 1])?;
    let view = buf.map_host(MapFlags::READ)?;
    assert_eq!(view.as_slice(), &[4, 3, 2, 1]);
    Ok(())
}

// ── Text input ───────────────────────────────────────────────────────

#[test]
fn from_file_reads_count_then_values() -> anyhow::Result<()> {
    let (_, rt) = common::runtime(false);
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, "4")?;
    for v in [0.5f32, 1.5, -2.25, 8.0] {
        writeln!(file, "{v}")?;
    }
    file.flush()?;

    let buf = ComputeBuffer::<f32>::from_file(&rt, file.path(), PlacementPolicy::HostOnly, MemFlags::READ_WRITE)?;
    assert_eq!(buf.len(), 4);
    let mut out = [0f32; 4];
    buf.host_read_to(&mut out)?;
    assert_eq!(out, [0.5, 1.5, -2.25, 8.0]);
    Ok(())
}

#[test]
fn from_file_reports_bad_line_and_missing_file() -> anyhow::Result<()> {
    let (driver, rt) = common::runtime(false);
    let mut file = tempfile::NamedTempFile::new()?;
    write!(file, "3\n1\n2\nx\n")?;
    file.flush()?;
    let err = ComputeBuffer::<u8>::from_file(&rt, file.path(), PlacementPolicy::HostOnly, MemFlags::READ_WRITE)
        .unwrap_err();
    assert!(matches!(err, SparkError::Parse { line: 4, .. }), "{err}");
    assert_eq!(driver.stats().live_buffers, 0);

    let missing = file.path().with_extension("missing");
    let err = ComputeBuffer::<u8>::from_file(&rt, &missing, PlacementPolicy::HostOnly, MemFlags::READ_WRITE)
        .unwrap_err();
    assert!(matches!(err, SparkError::Io { ref path, .. } if *path == missing), "{err}");
    Ok(())
}

// ── Profiling ────────────────────────────────────────────────────────

#[test]
fn buffer_events_are_recorded_by_class() -> anyhow::Result<()> {
    let (_, rt) = common::profiled_runtime(false);
    let buf = ComputeBuffer::<f32>::new(&rt, 32, PlacementPolicy::HostAndDevice, MemFlags::READ_WRITE)?;
    buf.host_write_from(&[1.0; 32])?;
    buf.to_device(true, &[])?;
    drop(buf.map_host(MapFlags::READ)?);

    let recorded = rt.recorded_events();
    // write + map + unmap
    assert_eq!(recorded.io.len(), 3);
    assert_eq!(recorded.compute.len(), 1);

    rt.reset_time();
    assert!(rt.recorded_events().io.is_empty());
    assert_eq!(rt.measure_time()?.total_ns(), 0);
    Ok(())
}

#[test]
fn nothing_is_recorded_without_profiling_or_on_failure() -> anyhow::Result<()> {
    let (_, plain) = common::runtime(false);
    let buf = ComputeBuffer::<u8>::new(&plain, 4, PlacementPolicy::HostAndDevice, MemFlags::READ_WRITE)?;
    buf.to_device(true, &[])?;
    assert_eq!(plain.recorded_events().compute.len(), 0);

    let (_, rt) = common::profiled_runtime(false);
    let a = ComputeBuffer::<u8>::new(&rt, 4, PlacementPolicy::HostOnly, MemFlags::READ_WRITE)?;
    let b = ComputeBuffer::<u8>::new(&rt, 5, PlacementPolicy::HostOnly, MemFlags::READ_WRITE)?;
    assert!(a.copy_host_to(&b, true, &[]).is_err());
    let summary = rt.measure_time()?;
    assert_eq!(summary.io_events + summary.compute_events, 0);
    Ok(())
}
