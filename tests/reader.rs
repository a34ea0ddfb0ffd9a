use std::fs;
use std::io::Write;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use flate2::write::GzEncoder;
use tempfile::TempDir;

use local_wikidata::error::MirrorError;
use local_wikidata::reader::{Compression, DumpReader, RawRecord, ResumePoint};

fn record(n: usize) -> String {
    format!(r#"{{"id":"Q{n}","type":"item","labels":{{"en":{{"language":"en","value":"entity {n}"}}}}}}"#)
}

/// Dump text split into `parts` chunks along line boundaries.
fn dump_parts(count: usize, parts: usize) -> Vec<String> {
    let mut lines = vec!["[".to_string()];
    for n in 1..=count {
        let sep = if n < count { "," } else { "" };
        lines.push(format!("{}{sep}", record(n)));
    }
    lines.push("]".to_string());

    let per_part = lines.len().div_ceil(parts);
    lines
        .chunks(per_part)
        .map(|chunk| chunk.iter().map(|line| format!("{line}\n")).collect::<String>())
        .collect()
}

fn write_gzip_members(path: &Utf8Path, parts: &[String]) {
    let mut out = Vec::new();
    for part in parts {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(part.as_bytes()).unwrap();
        out.extend(encoder.finish().unwrap());
    }
    fs::write(path, out).unwrap();
}

fn write_bzip2_streams(path: &Utf8Path, parts: &[String]) {
    let mut out = Vec::new();
    for part in parts {
        let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::fast());
        encoder.write_all(part.as_bytes()).unwrap();
        out.extend(encoder.finish().unwrap());
    }
    fs::write(path, out).unwrap();
}

fn scratch() -> (TempDir, Utf8PathBuf) {
    let dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, root)
}

fn read_all(path: &Utf8Path, resume: ResumePoint) -> Vec<RawRecord> {
    DumpReader::open(path, resume)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn ids(records: &[RawRecord]) -> Vec<String> {
    records
        .iter()
        .map(|r| {
            let value: serde_json::Value =
                serde_json::from_slice(r.bytes.strip_suffix(b",").unwrap_or(&r.bytes)).unwrap();
            value["id"].as_str().unwrap().to_string()
        })
        .collect()
}

#[test]
fn plain_dump_skips_array_framing() {
    let (_dir, root) = scratch();
    let path = root.join("dump.json");
    fs::write(&path, dump_parts(5, 1).concat()).unwrap();

    let reader = DumpReader::open(&path, ResumePoint::default()).unwrap();
    assert_eq!(reader.compression(), Compression::Plain);
    let records = reader.collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(ids(&records), ["Q1", "Q2", "Q3", "Q4", "Q5"]);
    // "[\n" precedes the first record.
    assert_eq!(records[0].offset, 2);
    for pair in records.windows(2) {
        assert_eq!(pair[0].end_offset, pair[1].offset);
    }
}

#[test]
fn plain_dump_resumes_at_exact_offset() {
    let (_dir, root) = scratch();
    let path = root.join("dump.json");
    fs::write(&path, dump_parts(6, 1).concat()).unwrap();

    let records = read_all(&path, ResumePoint::default());
    let resumed = read_all(&path, records[2].next_resume_point());
    assert_eq!(ids(&resumed), ["Q4", "Q5", "Q6"]);
    assert_eq!(resumed[0].offset, records[3].offset);
}

#[test]
fn gzip_members_are_resume_frames() {
    let (_dir, root) = scratch();
    let path = root.join("dump.json.gz");
    let parts = dump_parts(40, 4);
    write_gzip_members(&path, &parts);

    let records = read_all(&path, ResumePoint::default());
    assert_eq!(records.len(), 40);

    let first_member_len = parts[0].len() as u64;
    let later = records
        .iter()
        .find(|r| r.offset > first_member_len + 10)
        .unwrap();
    assert!(later.frame.compressed_offset > 0);
    assert!(later.frame.decompressed_offset >= first_member_len);
    assert!(later.frame.decompressed_offset <= later.end_offset);

    let index = records.iter().position(|r| r == later).unwrap();
    let resumed = read_all(&path, later.next_resume_point());
    assert_eq!(ids(&resumed), ids(&records[index + 1..]));
    assert_eq!(resumed[0].offset, records[index + 1].offset);
}

#[test]
fn gzip_resume_without_frame_rereads_from_start() {
    let (_dir, root) = scratch();
    let path = root.join("dump.json.gz");
    write_gzip_members(&path, &dump_parts(12, 3));

    let records = read_all(&path, ResumePoint::default());
    let resume = ResumePoint {
        byte_offset: records[7].end_offset,
        frame: Default::default(),
    };
    let resumed = read_all(&path, resume);
    assert_eq!(ids(&resumed), ["Q9", "Q10", "Q11", "Q12"]);
}

#[test]
fn bzip2_streams_are_resume_frames() {
    let (_dir, root) = scratch();
    let path = root.join("dump.json.bz2");
    write_bzip2_streams(&path, &dump_parts(30, 3));

    let reader = DumpReader::open(&path, ResumePoint::default()).unwrap();
    assert_eq!(reader.compression(), Compression::Bzip2);
    let records = reader.collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(records.len(), 30);
    assert!(records.last().unwrap().frame.compressed_offset > 0);

    let resumed = read_all(&path, records[24].next_resume_point());
    assert_eq!(ids(&resumed), ["Q26", "Q27", "Q28", "Q29", "Q30"]);
}

#[test]
fn gzip_checksum_mismatch_is_corrupt() {
    let (_dir, root) = scratch();
    let path = root.join("dump.json.gz");
    write_gzip_members(&path, &dump_parts(5, 1));
    let mut bytes = fs::read(&path).unwrap();
    let crc = bytes.len() - 8;
    bytes[crc] ^= 0xff;
    fs::write(&path, bytes).unwrap();

    let results = DumpReader::open(&path, ResumePoint::default())
        .unwrap()
        .collect::<Vec<_>>();
    assert_matches!(results.last(), Some(Err(MirrorError::CorruptDump { .. })));
}

#[test]
fn truncated_gzip_is_corrupt() {
    let (_dir, root) = scratch();
    let path = root.join("dump.json.gz");
    write_gzip_members(&path, &dump_parts(5, 1));
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

    let results = DumpReader::open(&path, ResumePoint::default())
        .unwrap()
        .collect::<Vec<_>>();
    assert_matches!(results.last(), Some(Err(MirrorError::CorruptDump { .. })));
}

#[test]
fn resume_past_end_is_corrupt() {
    let (_dir, root) = scratch();
    let path = root.join("dump.json");
    fs::write(&path, dump_parts(2, 1).concat()).unwrap();

    let resume = ResumePoint {
        byte_offset: 10_000,
        frame: Default::default(),
    };
    assert_matches!(
        DumpReader::open(&path, resume),
        Err(MirrorError::CorruptDump { offset: 10_000, .. })
    );
}

#[test]
fn oversized_record_is_format_error() {
    let (_dir, root) = scratch();
    let path = root.join("dump.json");
    fs::write(&path, dump_parts(2, 1).concat()).unwrap();

    let results = DumpReader::open(&path, ResumePoint::default())
        .unwrap()
        .with_max_record_bytes(16)
        .collect::<Vec<_>>();
    assert_matches!(results.as_slice(), [Err(MirrorError::Format { offset: 2, .. })]);
}

#[test]
fn unterminated_trailing_record_is_format_error() {
    let (_dir, root) = scratch();
    let path = root.join("dump.json");
    fs::write(&path, format!("{}\n{}", record(1), record(2))).unwrap();

    let results = DumpReader::open(&path, ResumePoint::default())
        .unwrap()
        .collect::<Vec<_>>();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert_matches!(results[1], Err(MirrorError::Format { .. }));
}
