//! End-to-end tests for the record log: positions, rollover, truncation,
//! locking, and recovery.

use anyhow::Result;
use recordlog::clean_log;
use recordlog::count_records;
use recordlog::detect_log_settings;
use recordlog::LogError;
use recordlog::LogPos;
use recordlog::LogWriter;

const BS: usize = 64;

fn new_writer(dir: &std::path::Path, bpf: usize) -> LogWriter {
    LogWriter::new(dir, "ev", BS, bpf, false, false)
}

#[test]
fn flushed_records_share_a_block() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut writer = new_writer(dir.path(), 4);
    writer.initialize()?;

    assert_eq!(writer.tell(), LogPos::new(0, 0, 0));
    writer.write_record(b"a")?;
    writer.flush(true)?;
    assert_eq!(writer.tell(), LogPos::new(0, 0, 1));
    writer.write_record(b"b")?;
    writer.flush(true)?;
    assert_eq!(writer.tell(), LogPos::new(0, 0, 2));

    let mut reader = writer.new_reader();
    reader.seek(LogPos::new(0, 0, 0))?;
    assert_eq!(reader.get_next_record(), Some(b"a".to_vec()));
    assert_eq!(reader.tell(), LogPos::new(0, 0, 1));
    assert_eq!(reader.get_next_record(), Some(b"b".to_vec()));
    assert_eq!(reader.get_next_record(), None);

    // Seek straight to the second record.
    reader.seek(LogPos::new(0, 0, 1))?;
    assert_eq!(reader.get_next_record(), Some(b"b".to_vec()));
    Ok(())
}

#[test]
fn rollover_at_block_and_file_boundaries() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut writer = new_writer(dir.path(), 2);
    writer.initialize()?;

    // 1-byte records frame to 10 bytes: six per 64-byte block.
    let mut positions = Vec::new();
    for i in 0..30u8 {
        positions.push(writer.tell());
        writer.write_record(&[i])?;
    }
    writer.flush(true)?;

    assert_eq!(positions[0], LogPos::new(0, 0, 0));
    assert_eq!(positions[5], LogPos::new(0, 0, 5));
    // Records are addressed where Tell put them; the reader resolves each.
    let mut reader = writer.new_reader();
    for (i, pos) in positions.iter().enumerate() {
        reader.seek(*pos)?;
        assert_eq!(
            reader.get_next_record(),
            Some(vec![i as u8]),
            "record {} at {}",
            i,
            pos
        );
    }

    // Sequential scan sees all thirty in order across the file boundary.
    reader.rewind();
    for i in 0..30u8 {
        assert_eq!(reader.get_next_record(), Some(vec![i]));
    }
    assert_eq!(reader.get_next_record(), None);
    assert_eq!(reader.num_errors(), 0);
    Ok(())
}

#[test]
fn straddling_record_across_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut writer = new_writer(dir.path(), 2);
    writer.initialize()?;

    let big = vec![9u8; BS * 3];
    let pos = writer.tell();
    writer.write_record(&big)?;
    writer.flush(true)?;

    let mut reader = writer.new_reader();
    reader.seek(pos)?;
    assert_eq!(reader.get_next_record(), Some(big));
    Ok(())
}

#[test]
fn seek_to_log_end_in_missing_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut writer = new_writer(dir.path(), 2);
    writer.initialize()?;

    // Fill file 0 completely: twelve 1-byte records fill both blocks.
    for i in 0..12u8 {
        writer.write_record(&[i])?;
    }
    writer.flush(true)?;
    assert_eq!(writer.tell(), LogPos::new(1, 0, 0));

    // File 1 does not exist yet; seeking to its first record is "log end".
    let mut reader = writer.new_reader();
    reader.seek(LogPos::new(1, 0, 0))?;
    assert_eq!(reader.get_next_record(), None);

    // Data arriving later is picked up from the same reader.
    writer.write_record(b"late")?;
    writer.flush(true)?;
    assert_eq!(reader.get_next_record(), Some(b"late".to_vec()));
    Ok(())
}

#[test]
fn truncate_at_block_boundary() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut writer = new_writer(dir.path(), 2);
    writer.initialize()?;

    for i in 0..12u8 {
        writer.write_record(&[i])?;
    }
    writer.flush(true)?;
    writer.write_record(b"tail")?;
    writer.flush(true)?;

    writer.truncate_at(LogPos::new(0, 1, 0))?;
    assert_eq!(writer.tell(), LogPos::new(0, 1, 0));

    // Only the first block's records survive.
    let mut reader = writer.new_reader();
    reader.rewind();
    for i in 0..6u8 {
        assert_eq!(reader.get_next_record(), Some(vec![i]));
    }
    assert_eq!(reader.get_next_record(), None);

    // New writes land where the truncation left off.
    writer.write_record(b"new")?;
    writer.flush(true)?;
    reader.seek(LogPos::new(0, 1, 0))?;
    assert_eq!(reader.get_next_record(), Some(b"new".to_vec()));
    Ok(())
}

#[test]
fn truncate_to_first_block_of_first_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut writer = new_writer(dir.path(), 2);
    writer.initialize()?;

    writer.write_record(b"gone")?;
    writer.flush(true)?;
    writer.truncate_at(LogPos::new(0, 0, 0))?;
    assert_eq!(writer.tell(), LogPos::new(0, 0, 0));

    let mut reader = writer.new_reader();
    reader.rewind();
    assert_eq!(reader.get_next_record(), None);
    Ok(())
}

#[test]
fn truncate_rejects_unaligned_position() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut writer = new_writer(dir.path(), 2);
    writer.initialize()?;
    writer.write_record(b"x")?;
    writer.flush(true)?;

    match writer.truncate_at(LogPos::new(0, 0, 1)) {
        Err(LogError::TruncateUnaligned(_)) => {}
        other => panic!("expected TruncateUnaligned, got {:?}", other.map(|_| ())),
    }
    Ok(())
}

#[test]
fn second_writer_is_locked_out() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut writer = new_writer(dir.path(), 2);
    writer.initialize()?;

    let mut intruder = new_writer(dir.path(), 2);
    match intruder.initialize() {
        Err(LogError::Locked { pid }) => assert_eq!(pid, std::process::id()),
        other => panic!("expected Locked, got {:?}", other.map(|_| ())),
    }

    // Releasing the lock lets the next writer in.
    writer.close();
    let mut successor = new_writer(dir.path(), 2);
    successor.initialize()?;
    Ok(())
}

#[test]
fn reopen_continues_in_a_fresh_block() -> Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let mut writer = new_writer(dir.path(), 4);
        writer.initialize()?;
        writer.write_record(b"before")?;
        writer.flush(true)?;
    }
    let mut writer = new_writer(dir.path(), 4);
    writer.initialize()?;
    // The flushed tail block is sealed by the restart.
    assert_eq!(writer.tell(), LogPos::new(0, 1, 0));
    writer.write_record(b"after")?;
    writer.flush(true)?;

    let mut reader = writer.new_reader();
    reader.rewind();
    assert_eq!(reader.get_next_record(), Some(b"before".to_vec()));
    assert_eq!(reader.get_next_record(), Some(b"after".to_vec()));
    Ok(())
}

#[test]
fn corrupt_record_is_skipped_and_counted() -> Result<()> {
    use std::io::Read;
    use std::io::Seek;
    use std::io::SeekFrom;
    use std::io::Write;

    let dir = tempfile::tempdir()?;
    let mut writer = new_writer(dir.path(), 4);
    writer.initialize()?;
    writer.write_record(b"one")?;
    // Spill into block 1 so a healthy record follows the damage.
    writer.write_record(&vec![5u8; BS])?;
    writer.write_record(b"three")?;
    writer.flush(true)?;

    let path = dir.path().join(format!("ev_{:010}_{:010}", BS, 0));
    let mut file = std::fs::OpenOptions::new().read(true).write(true).open(&path)?;
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(9))?;
    file.read_exact(&mut byte)?;
    byte[0] ^= 0xff;
    file.seek(SeekFrom::Start(9))?;
    file.write_all(&byte)?;

    let mut reader = writer.new_reader();
    reader.rewind();
    assert_eq!(reader.get_next_record(), Some(b"three".to_vec()));
    assert_eq!(reader.get_next_record(), None);
    assert_eq!(reader.num_errors(), 1);
    Ok(())
}

#[test]
fn maintenance_helpers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut writer = new_writer(dir.path(), 2);
    writer.initialize()?;
    // Complete files 0 and 1, leave a partial file 2.
    for i in 0..24u8 {
        writer.write_record(&[i])?;
    }
    writer.write_record(b"tail")?;
    writer.flush(true)?;

    let settings = detect_log_settings(dir.path()).expect("settings detected");
    assert_eq!(settings.file_base, "ev");
    assert_eq!(settings.block_size, BS);
    assert_eq!(settings.blocks_per_file, 2);

    let mut reader = writer.new_reader();
    assert_eq!(count_records(&mut reader), 25);

    assert_eq!(clean_log(dir.path(), "ev", LogPos::new(2, 0, 0), BS), 2);
    reader.rewind();
    assert_eq!(reader.get_next_record(), Some(b"tail".to_vec()));
    Ok(())
}
