use super::block_state::BlockState;
use crate::{
    cache::{block::Status, ReservationFailure},
    config,
    testing::{self, constant_line, noise_line},
};
use color_eyre::eyre;
use pretty_assertions_sorted as diff;
use stats::cache::{AccessKind, AccessStat, RequestStatus};

const LINE: usize = 256;

fn write_line(sim: &mut crate::sim::Simulation, addr: u64, line: crate::LineId, data: &[u8]) -> eyre::Result<()> {
    for (i, chunk) in data.chunks(64).enumerate() {
        sim.write(addr + (i * 64) as u64, line, chunk, None)?;
    }
    Ok(())
}

#[test]
fn test_clear_block_fill_has_no_memory_traffic() -> eyre::Result<()> {
    let config = testing::small_config();
    let mut sim = testing::simulation(&config)?;
    sim.cache.set_clear_value(&[0x11, 0x22, 0x33, 0x44])?;
    sim.reset_state()?;
    assert_eq!(sim.cache.block_state(0x100), BlockState::CLEAR);

    let line = sim.fetch(0x100, 1)?;
    assert_eq!(sim.cache.line_status(line), Status::REPLACING);

    // decompressor latency plus the line write over the write port
    let latency = config.cache.decompressor_latency as usize
        + LINE.div_ceil(config.cache.port_width);
    for _ in 0..latency {
        sim.step();
    }
    let mut data = [0u8; 4];
    assert!(!sim.cache.read(0x104, line, &mut data));
    sim.step();
    assert!(sim.cache.read(0x104, line, &mut data));
    assert_eq!(data, [0x11, 0x22, 0x33, 0x44]);

    let stats = sim.cache.stats();
    assert_eq!(stats.traffic.clear_fills, 1);
    assert_eq!(stats.traffic.read_transactions, 0);
    assert_eq!(stats.traffic.bytes_read, 0);
    assert_eq!(sim.mem.stats.read_transactions, 0);
    Ok(())
}

#[test]
fn test_constant_line_round_trips_compressed() -> eyre::Result<()> {
    let mut sim = testing::simulation(&testing::small_config())?;
    sim.reset_state()?;

    let addr = 0x200;
    let line = sim.allocate(addr, 4)?;
    assert_eq!(sim.cache.cache().num_requests(), 0);
    write_line(&mut sim, addr, line, &constant_line(0x01ef_cdab, LINE))?;
    sim.flush()?;

    assert_eq!(sim.cache.block_state(addr), BlockState::COMPRESSED(3));
    assert_eq!(sim.mem.read(addr, 4), vec![0xab, 0xcd, 0xef, 0x01]);
    let stats = sim.cache.stats();
    assert_eq!(stats.traffic.compressed_spills, [0, 0, 0, 1]);
    assert_eq!(stats.traffic.bytes_written, 4);
    assert_eq!(stats.traffic.write_transactions, 1);

    let line = sim.fetch(addr, 1)?;
    let data = sim.read(addr + 0x10, line, 4)?;
    assert_eq!(data, vec![0xab, 0xcd, 0xef, 0x01]);
    let stats = sim.cache.stats();
    assert_eq!(stats.traffic.compressed_fills, [0, 0, 0, 1]);
    assert_eq!(stats.traffic.bytes_read, 4);
    assert_eq!(stats.traffic.read_transactions, 1);
    assert!(sim.cache.is_idle());
    Ok(())
}

#[test]
fn test_allocate_of_compressed_block_fetches() -> eyre::Result<()> {
    let mut sim = testing::simulation(&testing::small_config())?;
    sim.reset_state()?;
    let line = sim.allocate(0x0, 4)?;
    write_line(&mut sim, 0x0, line, &constant_line(7, LINE))?;
    sim.flush()?;
    assert_eq!(sim.cache.block_state(0x0), BlockState::COMPRESSED(3));

    let line = sim.cache.allocate(0x0, 1).unwrap();
    assert_eq!(sim.cache.line_status(line), Status::REPLACING);
    assert_eq!(sim.cache.cache().num_requests(), 1);
    let data = sim.read(0x0, line, 4)?;
    assert_eq!(data, 7u32.to_le_bytes().to_vec());
    Ok(())
}

#[test]
fn test_partial_write_to_clear_block_is_merged() -> eyre::Result<()> {
    let mut sim = testing::simulation(&testing::small_config())?;
    sim.cache.set_clear_value(&[0x11, 0x22, 0x33, 0x44])?;
    sim.reset_state()?;

    let line = sim.allocate(0x300, 1)?;
    sim.write(0x300, line, &[0x12, 0x22, 0x33, 0x44], None)?;
    assert_eq!(sim.cache.line_status(line), Status::PARTIAL);
    sim.flush()?;

    // one pixel differs by one from the clear value
    assert_eq!(sim.cache.block_state(0x300), BlockState::COMPRESSED(2));
    let line = sim.fetch(0x300, 2)?;
    assert_eq!(sim.read(0x300, line, 4)?, vec![0x12, 0x22, 0x33, 0x44]);
    assert_eq!(sim.read(0x304, line, 4)?, vec![0x11, 0x22, 0x33, 0x44]);
    Ok(())
}

#[test]
fn test_partial_write_to_uncompressed_block_is_masked() -> eyre::Result<()> {
    let mut sim = testing::simulation(&testing::small_config())?;
    let background = noise_line(1, LINE);
    sim.mem.write(0x300, &background, None);
    assert_eq!(sim.cache.block_state(0x300), BlockState::UNCOMPRESSED);

    let line = sim.allocate(0x300, 1)?;
    sim.write(0x304, line, &[0xff; 4], None)?;
    sim.flush()?;

    assert_eq!(sim.cache.block_state(0x300), BlockState::UNCOMPRESSED);
    let mut expected = background[..12].to_vec();
    expected[4..8].copy_from_slice(&[0xff; 4]);
    assert_eq!(sim.mem.read(0x300, 12), expected);
    let stats = sim.cache.stats();
    assert_eq!(stats.traffic.uncompressed_spills, 1);
    assert_eq!(stats.traffic.bytes_written, LINE as u64);
    Ok(())
}

#[test]
fn test_fill_waits_for_spill_of_same_block() -> eyre::Result<()> {
    let mut config = testing::small_config();
    config.cache.cache.ways = 1;
    let mut sim = testing::simulation(&config)?;
    sim.reset_state()?;

    // both lines map to set 0
    let (a, b) = (0x000, 0x400);
    let noise = noise_line(7, LINE);
    let line = sim.allocate(a, 4)?;
    write_line(&mut sim, a, line, &noise)?;

    let line = sim.fetch(b, 1)?;
    let request = sim.cache.cache().peek_request().unwrap();
    assert!(request.spill && request.fill);
    assert_eq!(
        sim.cache.allocate(a, 1),
        Err(ReservationFailure::SPILL_PENDING)
    );
    assert_eq!(sim.read(b, line, 4)?, vec![0; 4]);

    // the spill of a is still being written to memory
    let line = sim.fetch(a, 1)?;
    assert_eq!(sim.read(a, line, LINE)?, noise);

    let stats = sim.cache.stats();
    assert!(stats.sim.request_stall_cycles > 0);
    assert_eq!(stats.traffic.uncompressed_spills, 1);
    assert_eq!(stats.traffic.uncompressed_fills, 1);
    assert_eq!(stats.traffic.clear_fills, 1);
    assert_eq!(sim.cache.block_state(a), BlockState::UNCOMPRESSED);
    assert_eq!(sim.cache.block_state(b), BlockState::CLEAR);
    assert_eq!(
        stats.cache.get(
            AccessKind::ALLOCATE,
            AccessStat::ReservationFailure(stats::cache::ReservationFailure::SPILL_PENDING)
        ),
        1
    );
    Ok(())
}

#[test]
fn test_stream_of_lines_through_few_tickets() -> eyre::Result<()> {
    let mut config = testing::small_config();
    config.cache.memory_tickets = 2;
    config.cache.max_transaction_size = 32;
    config.cache.input_buffers = 2;
    config.cache.output_buffers = 2;
    let mut sim = testing::simulation(&config)?;

    let lines: Vec<(u64, Vec<u8>)> = (0..16u32)
        .map(|i| {
            let data = if i % 2 == 0 {
                constant_line(i, LINE)
            } else {
                noise_line(i, LINE)
            };
            (u64::from(i) * LINE as u64, data)
        })
        .collect();

    for (addr, data) in &lines {
        let line = sim.allocate(*addr, 4)?;
        write_line(&mut sim, *addr, line, data)?;
    }
    sim.flush()?;
    assert_eq!(sim.cache.tickets().in_flight(), 0);

    for (addr, data) in &lines {
        let line = sim.fetch(*addr, 1)?;
        assert_eq!(&sim.read(*addr, line, LINE)?, data, "line {addr:#x}");
        let tickets = sim.cache.tickets();
        assert_eq!(tickets.free() + tickets.in_flight(), tickets.capacity());
    }

    let stats = sim.cache.stats();
    assert_eq!(stats.traffic.compressed_spills, [0, 0, 0, 8]);
    assert_eq!(stats.traffic.uncompressed_spills, 8);
    assert_eq!(stats.traffic.total_spills(), 16);
    assert_eq!(stats.traffic.compressed_fills, [0, 0, 0, 8]);
    assert_eq!(stats.traffic.uncompressed_fills, 8);
    // 4 byte compressed lines fit in a single transaction
    assert_eq!(stats.traffic.write_transactions, 8 + 8 * 8);
    Ok(())
}

#[test]
fn test_compression_disabled() -> eyre::Result<()> {
    let mut config = testing::small_config();
    config.cache.compression = false;
    let mut sim = testing::simulation(&config)?;

    let line = sim.allocate(0x0, 4)?;
    let data = constant_line(3, LINE);
    write_line(&mut sim, 0x0, line, &data)?;
    sim.flush()?;
    let line = sim.fetch(0x0, 1)?;
    assert_eq!(sim.read(0x0, line, LINE)?, data);

    assert_eq!(sim.cache.block_index(0x0), Some(0));
    assert_eq!(sim.cache.block_state(0x0), BlockState::UNCOMPRESSED);
    let stats = sim.cache.stats();
    assert_eq!(stats.traffic.uncompressed_spills, 1);
    assert_eq!(stats.traffic.compressed_spills, [0; 4]);
    assert_eq!(stats.traffic.uncompressed_fills, 1);
    assert_eq!(stats.traffic.bytes_written, LINE as u64);
    assert_eq!(stats.traffic.bytes_read, LINE as u64);
    // 256 bytes each way over a 16 byte bus
    assert!(stats.sim.bus_busy_cycles >= 32);
    Ok(())
}

#[test]
fn test_save_and_restore_state() -> eyre::Result<()> {
    let config = testing::small_config();
    let mut sim = testing::simulation(&config)?;
    let state_address = config.cache.state_address;
    let table_bytes = config.cache.state_table_bytes();
    sim.reset_state()?;

    let line = sim.allocate(0x0, 4)?;
    write_line(&mut sim, 0x0, line, &constant_line(0xabcd, LINE))?;
    sim.flush()?;

    sim.save_state()?;
    // block 0 compressed at level 3, all others clear
    assert_eq!(sim.mem.read(state_address, 4), vec![0x0e, 0, 0, 0]);
    assert!(sim
        .mem
        .read(state_address + 4, table_bytes - 4)
        .iter()
        .all(|&byte| byte == 0));

    sim.reset_state()?;
    assert_eq!(sim.cache.block_state(0x0), BlockState::CLEAR);
    sim.restore_state()?;
    assert_eq!(sim.cache.block_state(0x0), BlockState::COMPRESSED(3));
    assert_eq!(sim.cache.block_state(0x100), BlockState::CLEAR);

    let stats = sim.cache.stats();
    assert_eq!(stats.traffic.state_bytes, 2 * table_bytes as u64);
    Ok(())
}

#[test]
fn test_state_requests_are_level_triggered() -> eyre::Result<()> {
    let mut sim = testing::simulation(&testing::small_config())?;
    assert!(sim.cache.reset_state());
    assert!(sim.cache.reset_state());
    // busy with the reset
    assert!(sim.cache.save_state());
    // 64 blocks are cleared in a single cycle
    sim.step();
    assert!(!sim.cache.reset_state());
    assert!(sim.cache.is_idle());
    assert!(sim.cache.reset_state());
    Ok(())
}

#[test]
fn test_port_busy() -> eyre::Result<()> {
    let mut sim = testing::simulation(&testing::small_config())?;
    let line = sim.fetch(0x0, 2)?;
    sim.read(0x0, line, 4)?;
    let mut data = [0u8; 4];
    assert!(!sim.cache.read(0x4, line, &mut data));
    sim.step();
    assert!(sim.cache.read(0x4, line, &mut data));

    let stats = sim.cache.stats();
    assert_eq!(
        stats
            .cache
            .get(AccessKind::READ, AccessStat::Status(RequestStatus::PORT_BUSY)),
        1
    );
    assert_eq!(sim.cache.cache().line(line).reserves, 0);
    Ok(())
}

#[test]
fn test_block_indexing() -> eyre::Result<()> {
    let mut config = testing::small_config();
    config.cache.stamp_units = 2;
    config.cache.stamp_unit_stride = 512;
    config.cache.buffer_address = 0x1_0000;
    let mut sim = testing::simulation(&config)?;
    let cache = &mut sim.cache;

    assert_eq!(cache.block_index(0x0), None);
    assert_eq!(cache.block_index(0x1_0000), Some(0));
    assert_eq!(cache.block_index(0x1_0100), Some(1));
    // the next stride belongs to the other stamp unit
    assert_eq!(cache.block_index(0x1_0200), None);
    assert_eq!(cache.block_index(0x1_0300), None);
    assert_eq!(cache.block_index(0x1_0400), Some(2));
    // past the last tracked block
    assert_eq!(cache.block_index(0x1_0000 + 128 * 256), None);

    cache.swap(0x0);
    assert_eq!(cache.block_index(0x0), Some(0));
    cache.set_compression(false);
    assert_eq!(cache.block_index(0x0), Some(0));
    assert_eq!(cache.block_state(0x0), BlockState::UNCOMPRESSED);

    config.cache.stamp_unit = 1;
    let sim = testing::simulation(&config)?;
    assert_eq!(sim.cache.block_index(0x1_0000), None);
    assert_eq!(sim.cache.block_index(0x1_0200), Some(0));
    assert_eq!(sim.cache.block_index(0x1_0300), Some(1));
    assert_eq!(sim.cache.block_index(0x1_0600), Some(2));
    Ok(())
}

#[test]
fn test_other_stamp_unit_lines_are_untracked() -> eyre::Result<()> {
    let mut config = testing::small_config();
    config.cache.stamp_units = 2;
    config.cache.stamp_unit_stride = 256;
    let mut sim = testing::simulation(&config)?;
    sim.reset_state()?;

    // 0x000 is block 0 of this unit, 0x100 belongs to the other unit
    let line = sim.allocate(0x000, 4)?;
    write_line(&mut sim, 0x000, line, &constant_line(5, LINE))?;
    sim.flush()?;
    assert_eq!(sim.cache.block_state(0x000), BlockState::COMPRESSED(3));
    assert_eq!(sim.cache.block_state(0x100), BlockState::UNCOMPRESSED);

    // a partial write of the other unit's line is spilled with its mask
    let line = sim.allocate(0x100, 1)?;
    sim.write(0x104, line, &[0xff; 4], None)?;
    sim.flush()?;
    assert_eq!(sim.mem.read(0x104, 4), vec![0xff; 4]);
    assert_eq!(sim.cache.block_state(0x000), BlockState::COMPRESSED(3));
    let stats = sim.cache.stats();
    assert_eq!(stats.traffic.uncompressed_spills, 1);
    Ok(())
}

#[test]
fn test_pixel_format_changes_are_validated() -> eyre::Result<()> {
    let mut sim = testing::simulation(&testing::small_config())?;
    assert!(matches!(
        sim.cache.set_bytes_per_pixel(3),
        Err(config::Error::NotPowerOfTwo { .. })
    ));
    assert!(matches!(
        sim.cache.set_msaa_samples(64),
        Err(config::Error::OutOfRange { .. })
    ));
    // the clear value has to cover a whole pixel
    assert!(sim.cache.set_bytes_per_pixel(8).is_err());
    sim.cache.set_clear_value(&[1, 2, 3, 4, 5, 6, 7, 8])?;
    sim.cache.set_bytes_per_pixel(8)?;
    sim.cache.set_msaa_samples(4)?;
    diff::assert_eq!(sim.cache.config().bytes_per_pixel, 8);
    diff::assert_eq!(sim.cache.config().msaa_samples, 4);

    // 128 single byte samples do not divide the 64 words of a line
    sim.cache.set_msaa_samples(1)?;
    sim.cache.set_bytes_per_pixel(1)?;
    assert!(matches!(
        sim.cache.set_msaa_samples(128),
        Err(config::Error::NotMultiple {
            value: 64,
            multiple: 128,
            ..
        })
    ));
    diff::assert_eq!(sim.cache.config().msaa_samples, 1);
    sim.cache.set_msaa_samples(64)?;
    Ok(())
}

#[test]
fn test_compression_disabled_while_spill_waits_for_compressor() -> eyre::Result<()> {
    let mut sim = testing::simulation(&testing::small_config())?;
    sim.reset_state()?;
    let data = constant_line(0x0102_0304, LINE);
    let line = sim.allocate(0x0, 4)?;
    write_line(&mut sim, 0x0, line, &data)?;

    assert!(sim.cache.flush());
    sim.run_until("spill reaches the compressor", |sim| {
        sim.cache.compressing.is_some()
    })?;
    sim.cache.set_compression(false);
    sim.flush()?;

    assert_eq!(sim.cache.block_state(0x0), BlockState::UNCOMPRESSED);
    assert_eq!(sim.mem.read(0x0, LINE), data);
    let line = sim.fetch(0x0, 1)?;
    assert_eq!(sim.read(0x0, line, LINE)?, data);

    let stats = sim.cache.stats();
    assert_eq!(stats.traffic.compressed_spills, [0; 4]);
    assert_eq!(stats.traffic.uncompressed_spills, 1);
    assert_eq!(stats.traffic.uncompressed_fills, 1);
    Ok(())
}

#[test]
fn test_compression_enabled_again_after_spills() -> eyre::Result<()> {
    let mut sim = testing::simulation(&testing::small_config())?;
    sim.cache.set_clear_value(&[0x11, 0x22, 0x33, 0x44])?;
    sim.reset_state()?;

    let packed = constant_line(9, LINE);
    let line = sim.allocate(0x200, 4)?;
    write_line(&mut sim, 0x200, line, &packed)?;
    sim.flush()?;
    assert_eq!(sim.cache.block_state(0x200), BlockState::COMPRESSED(3));

    // the spill is pulled while compression is disabled
    sim.cache.set_compression(false);
    let noise = noise_line(5, LINE);
    let line = sim.allocate(0x100, 4)?;
    write_line(&mut sim, 0x100, line, &noise)?;
    assert!(sim.cache.flush());
    sim.run_until("spill is pulled", |sim| {
        sim.cache.cache().peek_request().is_none()
    })?;
    sim.cache.set_compression(true);
    sim.flush()?;

    // not left CLEAR, the fill has to read memory
    assert_eq!(sim.cache.block_state(0x100), BlockState::UNCOMPRESSED);
    let line = sim.fetch(0x100, 1)?;
    assert_eq!(sim.read(0x100, line, LINE)?, noise);

    // blocks compressed earlier are still decompressed
    sim.cache.set_compression(false);
    let line = sim.fetch(0x200, 1)?;
    assert_eq!(sim.read(0x200, line, LINE)?, packed);

    let stats = sim.cache.stats();
    assert_eq!(stats.traffic.clear_fills, 0);
    assert_eq!(stats.traffic.compressed_fills, [0, 0, 0, 1]);
    assert_eq!(stats.traffic.uncompressed_fills, 1);
    Ok(())
}

#[test]
fn test_ticket_uses_follow_tickets() -> eyre::Result<()> {
    let mut sim = testing::simulation(&testing::small_config())?;
    assert!(sim.cache.tickets_consistent());

    // an uncompressed fill holds tickets until its data arrives
    sim.cache.fetch(0x0, 1).unwrap();
    sim.run_until("fill is issued", |sim| sim.cache.tickets().in_flight() > 0)?;
    assert!(sim.cache.tickets_consistent());

    let ticket = crate::ticket::Ticket(0);
    assert!(sim.cache.tickets().is_in_flight(ticket));
    assert!(sim.cache.ticket_uses[0].is_some());
    sim.cache.tickets.release(ticket);
    assert!(!sim.cache.tickets_consistent());
    Ok(())
}

#[test]
#[should_panic(expected = "not a read reply")]
fn test_receive_rejects_requests() {
    let mut sim = testing::simulation(&testing::small_config()).unwrap();
    let fetch = crate::mem_fetch::MemFetch::read_request(
        0x0,
        4,
        crate::ticket::Ticket(0),
        crate::mem_fetch::Cookie::SaveState,
    );
    sim.cache.receive(fetch);
}
