//! Record I/O for file and dataset resources.
//!
//! Files hold one JSON object per line. Datasets are directories of
//! `part-NNNNN.jsonl` chunks read back in name order.

use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::TaskError;

/// One row of data.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Sorted chunk files of a dataset directory.
pub fn parts(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, TaskError> {
    let pattern = format!("{}/part-*.jsonl", glob::Pattern::escape(dir.as_str()));
    let mut parts = Vec::new();

    for entry in glob::glob(&pattern)? {
        parts.push(Utf8PathBuf::try_from(entry?)?);
    }

    parts.sort();
    Ok(parts)
}

/// Read records from either a JSON-lines file or a dataset directory.
pub fn read_records(path: &Utf8Path) -> Result<Vec<Record>, TaskError> {
    if path.is_dir() {
        let mut records = Vec::new();
        for part in parts(path)? {
            records.extend(read_lines(&part)?);
        }
        return Ok(records);
    }

    read_lines(path)
}

fn read_lines(path: &Utf8Path) -> Result<Vec<Record>, TaskError> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut records = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }

    Ok(records)
}

/// Write records as a JSON-lines file, replacing it.
pub fn write_records(path: &Utf8Path, records: &[Record]) -> Result<u64, TaskError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let mut writer = BufWriter::new(fs::File::create(path)?);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;

    Ok(records.len() as u64)
}

/// Write records as a dataset of `chunk_size` sized parts, replacing the directory.
///
/// Returns the number of parts; an empty input still produces one empty part.
pub fn write_dataset(dir: &Utf8Path, records: &[Record], chunk_size: usize) -> Result<u64, TaskError> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;

    if records.is_empty() {
        write_records(&dir.join(part_name(0)), records)?;
        return Ok(1);
    }

    let mut count = 0;
    for (i, chunk) in records.chunks(chunk_size.max(1)).enumerate() {
        write_records(&dir.join(part_name(i)), chunk)?;
        count += 1;
    }

    Ok(count)
}

/// Write to whichever shape the path should take.
pub fn write_to(
    path: &Utf8Path,
    as_dataset: bool,
    records: &[Record],
    chunk_size: usize,
) -> Result<(), TaskError> {
    if as_dataset {
        write_dataset(path, records, chunk_size)?;
    } else {
        write_records(path, records)?;
    }
    Ok(())
}

fn part_name(i: usize) -> String {
    format!("part-{i:05}.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_file_roundtrip() {
        let (dir, _) = testing::environment();
        let path = testing::utf8(dir.path()).join("nested/out.jsonl");
        let records = vec![testing::record(1, "a"), testing::record(2, "b")];

        assert_eq!(write_records(&path, &records).unwrap(), 2);
        assert_eq!(read_records(&path).unwrap(), records);
    }

    #[test]
    fn test_dataset_chunks_in_order() {
        let (dir, _) = testing::environment();
        let path = testing::utf8(dir.path()).join("ds");
        let records: Vec<_> = (1..=7).map(|i| testing::record(i, "x")).collect();

        assert_eq!(write_dataset(&path, &records, 3).unwrap(), 3);
        let names: Vec<_> = parts(&path)
            .unwrap()
            .iter()
            .filter_map(|p| p.file_name().map(String::from))
            .collect();
        assert_eq!(names, ["part-00000.jsonl", "part-00001.jsonl", "part-00002.jsonl"]);
        assert_eq!(read_records(&path).unwrap(), records);
    }

    #[test]
    fn test_empty_dataset() {
        let (dir, _) = testing::environment();
        let path = testing::utf8(dir.path()).join("ds");
        assert_eq!(write_dataset(&path, &[], 10).unwrap(), 1);
        assert!(read_records(&path).unwrap().is_empty());
    }

    #[test]
    fn test_blank_lines_skipped() {
        let (dir, _) = testing::environment();
        let path = testing::utf8(dir.path()).join("in.jsonl");
        fs::write(&path, "{\"a\":1}\n\n{\"a\":2}\n").unwrap();
        assert_eq!(read_records(&path).unwrap().len(), 2);
    }
}
