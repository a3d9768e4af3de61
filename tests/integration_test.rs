use byteorder::{LittleEndian, WriteBytesExt};
use octx::catalog::ChunkCatalog;
use octx::config::ReadOptions;
use octx::container::{Container, FormatKind};
use octx::frames::Buffering;
use octx::volume::{FundusPixels, Laterality, Sex, SliceData};
use octx::OctError;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, NamedTempFile, TempDir};

fn write_file(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

// ── Heidelberg fixture ───────────────────────────────────────────────────────

struct E2eChunk {
    slice_id: i32,
    ind:      u16,
    kind:     u32,
    payload:  Vec<u8>,
}

fn padded(buf: &mut Vec<u8>, text: &str, len: usize) {
    let mut b = text.as_bytes().to_vec();
    b.resize(len, 0);
    buf.write_all(&b).unwrap();
}

fn e2e_page(buf: &mut Vec<u8>, num_entries: u32, current: u32, prev: u32) {
    padded(buf, "MDbMDir", 12);
    buf.write_u32::<LittleEndian>(100).unwrap();
    buf.write_all(&[0; 20]).unwrap();
    for v in [num_entries, current, prev, 0] {
        buf.write_u32::<LittleEndian>(v).unwrap();
    }
}

fn image_payload(height: u32, width: u32, pixels: &[u8]) -> Vec<u8> {
    let mut p = Vec::new();
    for v in [0, 0, 0, height, width] {
        p.write_u32::<LittleEndian>(v).unwrap();
    }
    p.write_all(pixels).unwrap();
    p
}

fn oct_pixels(count: usize, base: u16) -> Vec<u8> {
    let mut p = Vec::new();
    for i in 0..count {
        p.write_u16::<LittleEndian>(base + i as u16).unwrap();
    }
    p
}

/// Header, empty main page, one directory page listing every chunk, then
/// the chunks.  Every chunk belongs to key 1_2_3.
fn e2e_file(chunks: &[E2eChunk]) -> Vec<u8> {
    let key = [1u32, 2, 3];
    let page = 36 + 52;
    let first_chunk = page + 52 + 44 * chunks.len() as u32;

    let mut buf = Vec::new();
    padded(&mut buf, "CMDb", 12);
    buf.write_u32::<LittleEndian>(100).unwrap();
    buf.write_all(&[0; 20]).unwrap();
    e2e_page(&mut buf, 0, page, 0);
    e2e_page(&mut buf, chunks.len() as u32, page, 0);

    let mut start = first_chunk;
    for (i, c) in chunks.iter().enumerate() {
        let pos = page + 52 + 44 * i as u32;
        for v in [pos, start, c.payload.len() as u32 + 60, 0, key[0], key[1], key[2]] {
            buf.write_u32::<LittleEndian>(v).unwrap();
        }
        buf.write_i32::<LittleEndian>(c.slice_id).unwrap();
        buf.write_all(&[0; 4]).unwrap();
        buf.write_u32::<LittleEndian>(c.kind).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        start += 60 + c.payload.len() as u32;
    }

    for c in chunks {
        padded(&mut buf, "MDbData", 12);
        for v in [0, 0, 0, c.payload.len() as u32, 0, key[0], key[1], key[2]] {
            buf.write_u32::<LittleEndian>(v).unwrap();
        }
        buf.write_i32::<LittleEndian>(c.slice_id).unwrap();
        buf.write_u16::<LittleEndian>(c.ind).unwrap();
        buf.write_u16::<LittleEndian>(0).unwrap();
        buf.write_u32::<LittleEndian>(c.kind).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_all(&c.payload).unwrap();
    }
    buf
}

fn e2e_chunks() -> Vec<E2eChunk> {
    let mut patient = Vec::new();
    padded(&mut patient, "Ada", 31);
    padded(&mut patient, "Lovelace", 51);
    padded(&mut patient, "", 15);
    // JDN 2447893 is 1990-01-01
    patient.write_u32::<LittleEndian>((2_447_893 + 14_558_805) * 64).unwrap();
    padded(&mut patient, "F", 1);
    padded(&mut patient, "PID7", 25);

    let mut laterality = vec![0u8; 14];
    laterality.extend_from_slice(&[b'R', 0, 0, 0, 0, 0]);

    let mut contour = Vec::new();
    for v in [0, 5, 0, 3] {
        contour.write_u32::<LittleEndian>(v).unwrap();
    }
    for v in [0.0f32, 5.5, f32::MAX] {
        contour.write_f32::<LittleEndian>(v).unwrap();
    }

    vec![
        E2eChunk { slice_id: 0, ind: 0, kind: 9, payload: patient },
        E2eChunk { slice_id: 0, ind: 0, kind: 11, payload: laterality },
        E2eChunk { slice_id: 0, ind: 0, kind: 1_073_741_824, payload: image_payload(2, 2, &[1, 2, 3, 4]) },
        E2eChunk { slice_id: 2, ind: 1, kind: 1_073_741_824, payload: image_payload(2, 3, &oct_pixels(6, 100)) },
        E2eChunk { slice_id: 4, ind: 1, kind: 1_073_741_824, payload: image_payload(2, 3, &oct_pixels(6, 200)) },
        // claims 2x3 but carries two samples
        E2eChunk { slice_id: 6, ind: 1, kind: 1_073_741_824, payload: image_payload(2, 3, &oct_pixels(2, 300)) },
        // slice id 0 has no slot
        E2eChunk { slice_id: 0, ind: 1, kind: 1_073_741_824, payload: image_payload(2, 3, &oct_pixels(6, 400)) },
        E2eChunk { slice_id: 2, ind: 0, kind: 10019, payload: contour },
    ]
}

#[test]
fn heidelberg_end_to_end() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir, "visit.E2E", &e2e_file(&e2e_chunks()));

    let container = Container::open(&path).unwrap();
    assert_eq!(container.kind(), FormatKind::HeidelbergE2e);
    let catalog = container.catalog().unwrap();
    assert_eq!(catalog.len(), 8);

    let (volumes, fundus) = container.assemble_volumes(&catalog).unwrap();
    assert_eq!(volumes.len(), 2);

    let primary = &volumes[0];
    assert_eq!(primary.volume_id, "1_2_3");
    assert!(!primary.overflow);
    // the short chunk in slot 2 was skipped
    assert_eq!(primary.slices.iter().map(|s| s.position).collect::<Vec<_>>(), vec![0, 1]);
    for s in &primary.slices {
        assert!(matches!(&s.data, SliceData::F32(a) if a.dim() == (2, 3)));
    }
    let meta = &primary.metadata;
    assert_eq!(meta.laterality, Some(Laterality::Right));
    assert_eq!(meta.patient.patient_id.as_deref(), Some("PID7"));
    assert_eq!(meta.patient.surname.as_deref(), Some("Lovelace"));
    assert_eq!(meta.patient.sex, Some(Sex::Female));
    assert_eq!(meta.patient.birth_date, chrono::NaiveDate::from_ymd_opt(1990, 1, 1));

    let layer = &meta.contours["contour5"];
    assert_eq!(layer.len(), 4);
    let line = layer[0].as_ref().unwrap();
    assert!(line[0].is_nan());
    assert_eq!(line[1], 5.5);
    assert!(line[2].is_nan());
    assert!(layer[1].is_none());

    let overflow = &volumes[1];
    assert_eq!(overflow.volume_id, "1_2_3-overflow");
    assert!(overflow.overflow);
    assert_eq!(overflow.len(), 1);
    assert!(overflow.metadata.contours.is_empty());

    assert_eq!(fundus.len(), 1);
    assert_eq!(fundus[0].image_id, "1_2_3");
    assert_eq!(fundus[0].laterality, Some(Laterality::Right));
    match &fundus[0].image {
        FundusPixels::Gray(a) => assert_eq!(a[[1, 0]], 3),
        other => panic!("unexpected fundus {other:?}"),
    }
}

#[test]
fn rescanning_gives_the_same_catalog() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir, "visit.e2e", &e2e_file(&e2e_chunks()));
    let container = Container::open(&path).unwrap();
    assert_eq!(container.catalog().unwrap().entries(), container.catalog().unwrap().entries());
}

#[test]
fn intensity_transform_changes_oct_pixels() {
    use octx::codec::IntensityTransform;

    let dir = tempdir().unwrap();
    let path = write_file(&dir, "visit.e2e", &e2e_file(&e2e_chunks()));
    let first = |intensity| {
        let c = Container::open_with_options(&path, ReadOptions::default().with_intensity(intensity)).unwrap();
        match c.read_volumes().unwrap().0.remove(0).slices.remove(0).data {
            SliceData::F32(a) => a,
            other => panic!("unexpected {}", other.kind()),
        }
    };
    assert_ne!(first(IntensityTransform::Current), first(IntensityTransform::Legacy));
}

// ── Topcon fixture ───────────────────────────────────────────────────────────

fn topcon_file(file_type: &str, chunks: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut buf = b"FOCT".to_vec();
    buf.write_all(file_type.as_bytes()).unwrap();
    buf.write_u32::<LittleEndian>(8).unwrap();
    buf.write_u32::<LittleEndian>(1).unwrap();
    for (tag, payload) in chunks {
        buf.write_u8(tag.len() as u8).unwrap();
        buf.write_all(tag.as_bytes()).unwrap();
        buf.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        buf.write_all(payload).unwrap();
    }
    buf.write_u8(0).unwrap();
    buf
}

fn oct_stack(width: u32, height: u32, slices: u32) -> Vec<u8> {
    let mut p = vec![0u8];
    for v in [width, height, 16, slices] {
        p.write_u32::<LittleEndian>(v).unwrap();
    }
    p.write_u8(0).unwrap();
    p.write_u32::<LittleEndian>(width * height * slices * 2).unwrap();
    p.write_all(&oct_pixels((width * height * slices) as usize, 0)).unwrap();
    p
}

#[test]
fn topcon_without_chunks_has_no_volumes() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir, "empty.fda", &topcon_file("FDA", &[]));
    let container = Container::open(&path).unwrap();
    assert!(container.catalog().unwrap().is_empty());
    let (volumes, fundus) = container.read_volumes().unwrap();
    assert!(volumes.is_empty());
    assert!(fundus.is_empty());
}

#[test]
fn topcon_wrong_file_code_is_mismatch() {
    let dir = tempdir().unwrap();
    let mut bytes = topcon_file("FDA", &[]);
    bytes[..4].copy_from_slice(b"XOCT");
    let path = write_file(&dir, "other.fda", &bytes);
    let err = Container::open(&path).unwrap().catalog().unwrap_err();
    assert!(err.is_mismatch(), "{err}");
}

#[test]
fn topcon_fds_volume() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir, "scan.fds", &topcon_file("FDS", &[("@IMG_SCAN_03", oct_stack(4, 3, 2))]));
    let container = Container::open(&path).unwrap();
    assert_eq!(container.kind(), FormatKind::TopconFds);
    let (volumes, _) = container.read_volumes().unwrap();
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].volume_id, "img_scan_03");
    assert_eq!(volumes[0].len(), 2);
    assert_eq!(volumes[0].slice_shape(), Some((3, 4)));
}

#[test]
fn topcon_metadata_picks_record_variant_by_size() {
    let dir = tempdir().unwrap();
    let long = write_file(&dir, "long.fda", &topcon_file("FDA", &[("@PARAM_OBS_02", vec![0u8; 90])]));
    let short = write_file(&dir, "short.fda", &topcon_file("FDA", &[("@PARAM_OBS_02", vec![0u8; 6])]));

    let records = Container::open(&long).unwrap().read_all_metadata().unwrap();
    assert_eq!(records["param_obs_02"].schema, "param_obs_02");
    let records = Container::open(&short).unwrap().read_all_metadata().unwrap();
    assert_eq!(records["param_obs_02"].schema, "param_obs_02_short");
}

#[test]
fn metadata_dump_serializes() {
    let dir = tempdir().unwrap();
    let path = write_file(
        &dir,
        "scan.fda",
        &topcon_file("FDA", &[("@PARAM_OBS_02", vec![0u8; 6]), ("@IMG_MOT_COMP_03", oct_stack(1, 1, 1))]),
    );
    let records = Container::open(&path).unwrap().read_all_metadata().unwrap();
    assert!(records.contains_key("img_mot_comp_03"));
    let json = serde_json::to_value(&records).unwrap();
    assert!(json.get("param_obs_02").is_some());
}

// ── Bioptigen fixture ────────────────────────────────────────────────────────

fn boct_key(buf: &mut Vec<u8>, k: &str, data_len: u32) {
    buf.write_u32::<LittleEndian>(k.len() as u32).unwrap();
    buf.write_all(k.as_bytes()).unwrap();
    buf.write_u32::<LittleEndian>(data_len).unwrap();
}

fn boct_int(buf: &mut Vec<u8>, k: &str, v: u32) {
    boct_key(buf, k, 4);
    buf.write_u32::<LittleEndian>(v).unwrap();
}

fn boct_float(buf: &mut Vec<u8>, k: &str, v: f64) {
    boct_key(buf, k, 8);
    buf.write_f64::<LittleEndian>(v).unwrap();
}

fn boct_text(buf: &mut Vec<u8>, k: &str, v: &str) {
    boct_key(buf, k, v.len() as u32);
    buf.write_all(v.as_bytes()).unwrap();
}

/// Rectangular scan: two time points of two frames, 3 lines of depth 2.
fn bioptigen_file() -> Vec<u8> {
    let (framecount, lines, depth) = (4u32, 3u32, 2u32);
    let mut b = Vec::new();
    b.write_u32::<LittleEndian>(0x0102_0304).unwrap();
    b.write_u16::<LittleEndian>(1).unwrap();
    boct_key(&mut b, "FRAMEHEADER", 0);
    boct_int(&mut b, "FRAMECOUNT", framecount);
    boct_int(&mut b, "LINECOUNT", lines);
    boct_int(&mut b, "LINELENGTH", depth);
    boct_int(&mut b, "SAMPLEFORMAT", 2);
    boct_text(&mut b, "DESCRIPTION", "");
    boct_float(&mut b, "XMIN", 0.0);
    boct_float(&mut b, "XMAX", 1.0);
    boct_text(&mut b, "XCAPTION", "");
    boct_float(&mut b, "YMIN", 0.0);
    boct_float(&mut b, "YMAX", 1.0);
    boct_text(&mut b, "YCAPTION", "");
    boct_int(&mut b, "SCANTYPE", 1);
    for k in ["SCANDEPTH", "SCANLENGTH", "AZSCANLENGTH", "ELSCANLENGTH", "OBJECTDISTANCE", "SCANANGLE"] {
        boct_float(&mut b, k, 2.0);
    }
    boct_int(&mut b, "SCANS", 2);
    boct_int(&mut b, "FRAMES", 2);
    boct_int(&mut b, "DOPPLERFLAG", 0);
    boct_text(&mut b, "CONFIG", "");
    b.write_u32::<LittleEndian>(0).unwrap();

    for f in 0..framecount {
        boct_key(&mut b, "FRAMEDATA", 0);
        boct_key(&mut b, "FRAMEDATETIME", 16);
        for v in [2021u16, 3, 2, 9, 10, 11, 12, 0] {
            b.write_u16::<LittleEndian>(v).unwrap();
        }
        boct_float(&mut b, "FRAMETIMESTAMP", f as f64 * 0.5);
        boct_int(&mut b, "FRAMELINES", lines);
        boct_key(&mut b, "FRAMESAMPLES", lines * depth * 2);
        b.write_all(&oct_pixels((lines * depth) as usize, (f * 10) as u16)).unwrap();
        b.write_u32::<LittleEndian>(0).unwrap();
    }
    b
}

#[test]
fn bioptigen_memory_and_disk_buffers_agree() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir, "subject_01.OCT", &bioptigen_file());
    let container = Container::open(&path).unwrap();
    assert_eq!(container.kind(), FormatKind::BioptigenOct);

    let catalog = container.catalog().unwrap();
    assert!(matches!(catalog, ChunkCatalog::Frames(_)));
    assert_eq!(catalog.len(), 4);

    let memory = container.load_frames(&catalog, Buffering::Memory).unwrap();
    let disk = container.load_frames(&catalog, Buffering::Disk).unwrap();
    assert!(memory.is_complete() && disk.is_complete());
    assert!(disk.backing_path().is_some());
    assert_eq!(memory.to_array().unwrap(), disk.to_array().unwrap());
    assert_eq!(memory.frame(1, 1).unwrap()[[0, 0]], 30);
}

#[test]
fn bioptigen_volumes_per_time_point() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir, "subject_01.oct", &bioptigen_file());
    let options = ReadOptions::default().with_buffering(Buffering::Disk);
    let (volumes, fundus) = Container::open_with_options(&path, options).unwrap().read_volumes().unwrap();
    assert!(fundus.is_empty());
    assert_eq!(volumes.len(), 2);
    assert_eq!(volumes[1].volume_id, "t1");
    assert_eq!(volumes[1].len(), 2);
    assert_eq!(volumes[0].metadata.patient.patient_id.as_deref(), Some("subject_01"));
    assert!(volumes[0].metadata.acquisition.is_some());
}

// ── Optovue fixture ──────────────────────────────────────────────────────────

const OPTOVUE_SIDECAR: &str = "Window Height 2\nScan Length 2\nScan Usage 2\n";

fn optovue_stream() -> Vec<u8> {
    (0..8).flat_map(|i| (i as f32).to_le_bytes()).collect()
}

#[test]
fn lowercase_oct_falls_back_to_optovue() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir, "scan.oct", &optovue_stream());
    write_file(&dir, "scan.txt", OPTOVUE_SIDECAR.as_bytes());

    let container = Container::open(&path).unwrap();
    assert_eq!(container.kind(), FormatKind::OptovueOct);
    let catalog = container.catalog().unwrap();
    assert_eq!(catalog.len(), 1);
    let (volumes, _) = container.assemble_volumes(&catalog).unwrap();
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].volume_id, "volume0");
    assert_eq!(volumes[0].len(), 2);
    assert_eq!(volumes[0].slice_shape(), Some((2, 2)));
}

#[test]
fn optovue_without_sidecar() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir, "scan.oct", &optovue_stream());
    match Container::open(&path) {
        Err(OctError::MissingSidecar(p)) => assert_eq!(p, dir.path().join("scan.txt")),
        other => panic!("unexpected {other:?}"),
    }
}

// ── Zeiss ────────────────────────────────────────────────────────────────────

#[test]
fn zeiss_interlaced_slices() {
    let dir = tempdir().unwrap();
    let bytes: Vec<u8> = (0..16).collect();
    let path = write_file(&dir, "cube.img", &bytes);
    let options = ReadOptions::default().with_zeiss_shape(4, 2).with_zeiss_interlaced(true);
    let container = Container::open_with_options(&path, options).unwrap();

    assert_eq!(container.catalog().unwrap().len(), 2);
    let (volumes, _) = container.read_volumes().unwrap();
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].volume_id, "img");
    assert_eq!(volumes[0].len(), 4);
    assert_eq!(volumes[0].slice_shape(), Some((2, 2)));
}

#[test]
fn zeiss_odd_rows_cannot_interlace() {
    let dir = tempdir().unwrap();
    let path = write_file(&dir, "cube.img", &[0u8; 6]);
    let options = ReadOptions::default().with_zeiss_shape(3, 2).with_zeiss_interlaced(true);
    let err = Container::open_with_options(&path, options).unwrap().catalog().unwrap_err();
    assert!(matches!(err, OctError::Format(_)));
}

// ── Detection ────────────────────────────────────────────────────────────────

#[test]
fn absent_file_is_not_found() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gone.fds");
    match Container::open(&path) {
        Err(OctError::FileNotFound(p)) => assert_eq!(p, path),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn unknown_extension_is_unsupported() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"not an oct file").unwrap();
    let err = Container::open(file.path()).unwrap_err();
    assert!(matches!(err, OctError::UnsupportedFormat(_)));
    assert!(FormatKind::from_path(Path::new("x.dcm")).is_err());
}
