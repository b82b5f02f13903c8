use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use assert_matches::assert_matches;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use camino::Utf8PathBuf;

use content_packager::cache::{CacheOp, FileCache, cache_key};
use content_packager::domain::Preset;
use content_packager::drive::{DriveClient, DriveFile};
use content_packager::error::{ErrorKind, PipelineError};
use content_packager::http::{ResponseInfo, WebClient};
use content_packager::media::{MediaProbe, MediaTool};
use content_packager::metadata::FileMetadata;
use content_packager::pipeline::{FileHandler, Pipeline, Stage, StageRole, Tools, Workspace};
use content_packager::settings::{AudioContext, Settings};
use content_packager::store::{Storage, hash_bytes};
use content_packager::video_host::{VideoHostClient, VideoRequest};

#[derive(Default)]
struct MockWeb {
    bodies: HashMap<String, (Vec<u8>, Option<String>)>,
    calls: Mutex<usize>,
}

impl MockWeb {
    fn serving(url: &str, body: &[u8], content_type: &str) -> Self {
        let mut bodies = HashMap::new();
        bodies.insert(
            url.to_string(),
            (body.to_vec(), Some(content_type.to_string())),
        );
        Self {
            bodies,
            calls: Mutex::new(0),
        }
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl WebClient for MockWeb {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<ResponseInfo, PipelineError> {
        *self.calls.lock().unwrap() += 1;
        let (body, content_type) = self.bodies.get(url).ok_or_else(|| PipelineError::HttpStatus {
            status: 404,
            url: url.to_string(),
        })?;
        sink.write_all(body)
            .map_err(|err| PipelineError::Http(err.to_string()))?;
        Ok(ResponseInfo {
            final_url: url.to_string(),
            content_type: content_type.clone(),
            content_disposition: None,
        })
    }
}

#[derive(Default)]
struct MockDrive {
    files: HashMap<String, (DriveFile, Vec<u8>)>,
    calls: Mutex<usize>,
    exports: Mutex<usize>,
    downloads: Mutex<usize>,
}

impl MockDrive {
    fn serving(id: &str, name: &str, mime_type: &str, body: &[u8]) -> Self {
        let file = DriveFile {
            id: id.to_string(),
            name: Some(name.to_string()),
            mime_type: mime_type.to_string(),
        };
        let mut files = HashMap::new();
        files.insert(id.to_string(), (file, body.to_vec()));
        Self {
            files,
            ..Self::default()
        }
    }
}

impl DriveClient for MockDrive {
    fn file_info(&self, id: &str) -> Result<DriveFile, PipelineError> {
        *self.calls.lock().unwrap() += 1;
        self.files
            .get(id)
            .map(|(file, _)| file.clone())
            .ok_or_else(|| PipelineError::HttpStatus {
                status: 404,
                url: id.to_string(),
            })
    }

    fn download(&self, file: &DriveFile, sink: &mut dyn Write) -> Result<(), PipelineError> {
        *self.calls.lock().unwrap() += 1;
        if file.is_native() {
            *self.exports.lock().unwrap() += 1;
        } else {
            *self.downloads.lock().unwrap() += 1;
        }
        if let Some((_, body)) = self.files.get(&file.id) {
            sink.write_all(body)
                .map_err(|err| PipelineError::Http(err.to_string()))?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct MockVideoHost {
    videos: Mutex<usize>,
    subtitles: Mutex<usize>,
}

impl VideoHostClient for MockVideoHost {
    fn download_video(
        &self,
        _url: &str,
        _request: &VideoRequest,
        dest_dir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        *self.videos.lock().unwrap() += 1;
        let output = dest_dir.join("video.mp4");
        fs::write(&output, b"hosted video bytes").unwrap();
        Ok(output)
    }

    fn download_subtitle(
        &self,
        _url: &str,
        language: &str,
        _use_proxy: bool,
        dest_dir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        *self.subtitles.lock().unwrap() += 1;
        let output = dest_dir.join(format!("video.{language}.vtt"));
        let content = format!("WEBVTT\n\n00:00:01.000 --> 00:00:02.500\nhello in {language}\n");
        fs::write(&output, content).unwrap();
        Ok(output)
    }
}

struct MockMedia {
    height: u32,
    duration: Option<f64>,
    has_audio: bool,
    probes: Mutex<usize>,
    transcodes: Mutex<usize>,
    decodes: Mutex<usize>,
}

impl MockMedia {
    fn new(height: u32, duration: Option<f64>) -> Self {
        Self {
            height,
            duration,
            has_audio: true,
            probes: Mutex::new(0),
            transcodes: Mutex::new(0),
            decodes: Mutex::new(0),
        }
    }
}

impl Default for MockMedia {
    fn default() -> Self {
        Self::new(360, Some(12.4))
    }
}

impl MediaTool for MockMedia {
    fn probe(&self, _path: &Path) -> Result<MediaProbe, PipelineError> {
        *self.probes.lock().unwrap() += 1;
        Ok(MediaProbe {
            duration: self.duration,
            width: Some(self.height * 16 / 9),
            height: Some(self.height),
            has_video: true,
            has_audio: self.has_audio,
        })
    }

    fn transcode(&self, input: &Path, output: &Path, _args: &[String]) -> Result<(), PipelineError> {
        *self.transcodes.lock().unwrap() += 1;
        let mut content = fs::read(input).unwrap();
        content.extend_from_slice(b"+transcoded");
        fs::write(output, content).unwrap();
        Ok(())
    }

    fn decode_duration(&self, _path: &Path) -> Result<Option<f64>, PipelineError> {
        *self.decodes.lock().unwrap() += 1;
        Ok(Some(7.6))
    }
}

struct Harness {
    temp: tempfile::TempDir,
    web: Arc<MockWeb>,
    drive: Arc<MockDrive>,
    video_host: Arc<MockVideoHost>,
    media: Arc<MockMedia>,
    pipeline: Pipeline,
}

impl Harness {
    fn new() -> Self {
        Self::with(MockWeb::default(), MockMedia::default())
    }

    fn with(web: MockWeb, media: MockMedia) -> Self {
        Self::build(web, MockDrive::default(), media)
    }

    fn with_drive(drive: MockDrive) -> Self {
        Self::build(MockWeb::default(), drive, MockMedia::default())
    }

    fn build(web: MockWeb, drive: MockDrive, media: MockMedia) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let web = Arc::new(web);
        let drive = Arc::new(drive);
        let video_host = Arc::new(MockVideoHost::default());
        let media = Arc::new(media);
        let workspace = Workspace::new(
            Storage::new(root.join("storage")),
            FileCache::new(root.join("cache")),
        );
        let tools = Tools {
            web: web.clone(),
            drive: drive.clone(),
            video_host: video_host.clone(),
            media: media.clone(),
        };
        Self {
            temp,
            web,
            drive,
            video_host,
            media,
            pipeline: Pipeline::standard(workspace, tools),
        }
    }

    fn write_input(&self, name: &str, content: &[u8]) -> String {
        let path = self.temp.path().join("inputs").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn storage(&self) -> &Storage {
        &self.pipeline.workspace().storage
    }
}

fn three_page_pdf() -> Vec<u8> {
    use lopdf::{Document, Object, Stream, dictionary};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids = Vec::new();
    for _ in 0..3 {
        let content_id = doc.add_object(Stream::new(dictionary! {}, b"BT ET".to_vec()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        });
        kids.push(Object::Reference(page_id));
    }
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => 3,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

fn jpeg_bytes() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(8, 8, image::Rgb([200, 40, 40]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
    out.into_inner()
}

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

const SRT: &[u8] = b"1\n00:00:01,000 --> 00:00:02,500\nBonjour\n\n2\n00:00:03,000 --> 00:00:04,000\nau revoir\n";

#[test]
fn local_pdf_becomes_document() {
    let harness = Harness::new();
    let pdf = three_page_pdf();
    let locator = harness.write_input("sample.pdf", &pdf);

    let records = harness
        .pipeline
        .execute(&locator, &Settings::new(), false)
        .unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    let expected = format!("{}.pdf", hash_bytes(&pdf));
    assert_eq!(record.filename.as_deref(), Some(expected.as_str()));
    assert_eq!(record.preset, Some(Preset::Document));
    assert_eq!(record.duration, None);
    assert_eq!(record.original_filename.as_deref(), Some("sample.pdf"));
    assert!(harness.pipeline.verify(&expected).unwrap());
    assert!(harness.pipeline.failed().is_empty());
}

#[test]
fn inline_jpeg_is_stored_unchanged() {
    let harness = Harness::new();
    let jpeg = jpeg_bytes();
    let locator = format!("data:image/jpeg;base64,{}", STANDARD.encode(&jpeg));

    let records = harness
        .pipeline
        .execute(&locator, &Settings::new(), false)
        .unwrap();
    assert_eq!(records.len(), 1);
    let expected = format!("{}.jpg", hash_bytes(&jpeg));
    assert_eq!(records[0].filename.as_deref(), Some(expected.as_str()));
    assert_eq!(harness.storage().read(&expected).unwrap(), jpeg);
    assert_eq!(*harness.web.calls.lock().unwrap(), 0);
}

#[test]
fn local_jpeg_spelling_is_stored_as_jpg() {
    let harness = Harness::new();
    let jpeg = jpeg_bytes();
    let locator = harness.write_input("photo.jpeg", &jpeg);

    let records = harness
        .pipeline
        .execute(&locator, &Settings::new(), false)
        .unwrap();
    assert_eq!(records.len(), 1);
    let expected = format!("{}.jpg", hash_bytes(&jpeg));
    assert_eq!(records[0].filename.as_deref(), Some(expected.as_str()));
    assert_eq!(records[0].original_filename.as_deref(), Some("photo.jpeg"));
    assert_eq!(harness.storage().read(&expected).unwrap(), jpeg);
}

#[test]
fn srt_with_language_becomes_webvtt() {
    let harness = Harness::new();
    let locator = harness.write_input("captions.srt", SRT);
    let settings = Settings::new().with("language", "fr");

    let records = harness.pipeline.execute(&locator, &settings, false).unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    let filename = record.filename.clone().unwrap();
    assert!(filename.ends_with(".vtt"));
    assert_eq!(record.language.as_deref(), Some("fr"));
    assert_eq!(record.preset, Some(Preset::VideoSubtitle));

    let stored = String::from_utf8(harness.storage().read(&filename).unwrap()).unwrap();
    assert!(stored.starts_with("WEBVTT"));
    assert!(stored.contains("00:00:01.000 --> 00:00:02.500"));
    assert!(stored.contains("Bonjour"));
}

#[test]
fn epub_without_container_is_recorded_as_failed() {
    let harness = Harness::new();
    let archive = zip_bytes(&[("OEBPS/chapter1.xhtml", b"<html><body>hi</body></html>")]);
    let locator = harness.write_input("book.epub", &archive);

    let err = harness
        .pipeline
        .execute(&locator, &Settings::new(), false)
        .unwrap_err();
    assert_matches!(err, PipelineError::MissingEntry { ref entry, .. } if entry == "META-INF/container.xml");

    let failed = harness.pipeline.failed().snapshot();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].handler, "epub");
    assert_eq!(failed[0].kind, ErrorKind::InvalidFile);
    assert!(failed[0].error.contains("META-INF/container.xml"));
    assert_eq!(failed[0].locator, locator);
    let stored = format!("{}.epub", hash_bytes(&archive));
    assert_eq!(failed[0].path, harness.storage().path_for(&stored).to_string());
    assert!(harness.pipeline.failed().contains(&locator));
}

#[test]
fn hosted_video_fans_out_into_subtitle_records() {
    let harness = Harness::new();
    let locator = "https://www.youtube.com/watch?v=abc123";
    let settings = Settings::new().with("subtitle_languages", serde_json::json!(["en", "fr"]));

    let records = harness.pipeline.execute(locator, &settings, false).unwrap();
    assert_eq!(records.len(), 3);

    let video = &records[0];
    assert!(video.filename.as_deref().unwrap().ends_with(".mp4"));
    assert_eq!(video.preset, Some(Preset::LowResVideo));
    assert_eq!(video.duration, Some(12));
    assert_eq!(video.language, None);

    let languages = records[1..]
        .iter()
        .map(|record| record.language.clone().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(languages, vec!["en".to_string(), "fr".to_string()]);
    for record in &records[1..] {
        assert_eq!(record.preset, Some(Preset::VideoSubtitle));
        assert!(record.filename.as_deref().unwrap().ends_with(".vtt"));
    }
    assert_ne!(records[1].filename, records[2].filename);
    assert_eq!(*harness.video_host.videos.lock().unwrap(), 1);
    assert_eq!(*harness.video_host.subtitles.lock().unwrap(), 2);
    assert_eq!(*harness.web.calls.lock().unwrap(), 0);
}

#[test]
fn tall_video_is_high_res() {
    let harness = Harness::with(MockWeb::default(), MockMedia::new(720, Some(59.5)));
    let locator = harness.write_input("lecture.mp4", b"not really an mp4");

    let records = harness
        .pipeline
        .execute(&locator, &Settings::new(), false)
        .unwrap();
    assert_eq!(records[0].preset, Some(Preset::HighResVideo));
    assert_eq!(records[0].duration, Some(60));
    assert_eq!(*harness.media.transcodes.lock().unwrap(), 0);
}

#[test]
fn missing_container_duration_falls_back_to_decoding() {
    let harness = Harness::with(MockWeb::default(), MockMedia::new(360, None));
    let locator = harness.write_input("clip.webm", b"webm bytes");

    let records = harness
        .pipeline
        .execute(&locator, &Settings::new(), false)
        .unwrap();
    assert_eq!(records[0].duration, Some(8));
    assert_eq!(*harness.media.decodes.lock().unwrap(), 1);
}

#[test]
fn second_run_is_served_from_cache() {
    let url = "https://example.org/files/lesson.pdf";
    let pdf = three_page_pdf();
    let harness = Harness::with(
        MockWeb::serving(url, &pdf, "application/pdf"),
        MockMedia::default(),
    );

    let first = harness.pipeline.execute(url, &Settings::new(), false).unwrap();
    let second = harness.pipeline.execute(url, &Settings::new(), false).unwrap();
    assert_eq!(harness.web.calls(), 1);
    assert_eq!(first[0].filename, second[0].filename);
    assert_eq!(first[0].preset, Some(Preset::Document));
    assert_eq!(second[0].original_filename.as_deref(), Some("lesson.pdf"));

    harness.pipeline.execute(url, &Settings::new(), true).unwrap();
    assert_eq!(harness.web.calls(), 2);
}

#[test]
fn corrupt_cached_file_is_fetched_again() {
    let url = "https://example.org/files/lesson.pdf";
    let pdf = three_page_pdf();
    let harness = Harness::with(
        MockWeb::serving(url, &pdf, "application/pdf"),
        MockMedia::default(),
    );

    let first = harness.pipeline.execute(url, &Settings::new(), false).unwrap();
    let filename = first[0].filename.clone().unwrap();
    fs::write(harness.storage().path_for(&filename).as_std_path(), b"garbage").unwrap();
    assert!(!harness.pipeline.verify(&filename).unwrap());

    let second = harness.pipeline.execute(url, &Settings::new(), false).unwrap();
    assert_eq!(harness.web.calls(), 2);
    assert_eq!(second[0].filename.as_deref(), Some(filename.as_str()));
    assert!(harness.pipeline.verify(&filename).unwrap());
}

#[test]
fn unclaimed_locators_fail_without_touching_clients() {
    let harness = Harness::new();
    for locator in ["ftp://example.org/notes.pdf", "no/such/file.pdf"] {
        let err = harness
            .pipeline
            .execute(locator, &Settings::new(), false)
            .unwrap_err();
        assert_matches!(err, PipelineError::NoHandler(_));
        assert!(harness.pipeline.failed().contains(locator));
    }
    assert_eq!(harness.web.calls(), 0);
    assert_eq!(*harness.drive.calls.lock().unwrap(), 0);
    assert_eq!(*harness.video_host.videos.lock().unwrap(), 0);
}

#[test]
fn unreachable_url_is_recorded_by_web_handler() {
    let harness = Harness::new();
    let url = "https://example.org/gone.mp4";
    let err = harness
        .pipeline
        .execute(url, &Settings::new(), false)
        .unwrap_err();
    assert_matches!(err, PipelineError::HttpStatus { status: 404, .. });
    let failed = harness.pipeline.failed().snapshot();
    assert_eq!(failed[0].handler, "web");
    assert_eq!(failed[0].path, url);
    assert_eq!(failed[0].locator, url);
}

#[test]
fn html5_archive_validation_and_stable_compression() {
    let harness = Harness::new();
    let index: &[u8] = b"<html><body><h1>Quiz</h1></body></html>";
    let archive = zip_bytes(&[("index.html", index), ("media/intro.mp4", b"intro video")]);
    let locator = harness.write_input("quiz.zip", &archive);

    let plain = harness
        .pipeline
        .execute(&locator, &Settings::new(), false)
        .unwrap();
    let expected = format!("{}.zip", hash_bytes(&archive));
    assert_eq!(plain[0].filename.as_deref(), Some(expected.as_str()));
    assert_eq!(plain[0].preset, Some(Preset::Html5Zip));

    let settings = Settings::new().with("compress", true);
    let compressed = harness.pipeline.execute(&locator, &settings, false).unwrap();
    let compressed_name = compressed[0].filename.clone().unwrap();
    assert_ne!(compressed_name, expected);
    assert_eq!(*harness.media.transcodes.lock().unwrap(), 1);

    let stored_path = harness.storage().path_for(&compressed_name).to_string();
    let again = harness
        .pipeline
        .execute(&stored_path, &settings, true)
        .unwrap();
    let again_name = again[0].filename.clone().unwrap();
    let twice = harness.storage().read(&again_name).unwrap();
    let mut reader = zip::ZipArchive::new(Cursor::new(twice)).unwrap();
    assert!(reader.by_name("index.html").is_ok());
    assert_eq!(reader.len(), 2);
    assert_eq!(*harness.media.transcodes.lock().unwrap(), 2);

    let broken = zip_bytes(&[("media/intro.mp4", b"intro video")]);
    let broken_locator = harness.write_input("broken.zip", &broken);
    let err = harness
        .pipeline
        .execute(&broken_locator, &Settings::new(), false)
        .unwrap_err();
    assert_matches!(err, PipelineError::MissingEntry { ref entry, .. } if entry == "index.html");
}

#[test]
fn archive_rewrite_is_deterministic() {
    let harness = Harness::new();
    let archive = zip_bytes(&[("index.html", b"<body>x</body>"), ("notes.txt", b"plain")]);
    let locator = harness.write_input("static.zip", &archive);
    let settings = Settings::new().with("compress", true);

    let first = harness.pipeline.execute(&locator, &settings, false).unwrap();
    let first_name = first[0].filename.clone().unwrap();
    let first_path = harness.storage().path_for(&first_name).to_string();
    let second = harness.pipeline.execute(&first_path, &settings, true).unwrap();
    assert_eq!(second[0].filename.as_deref(), Some(first_name.as_str()));
}

#[test]
fn video_compression_is_cached() {
    let harness = Harness::new();
    let locator = harness.write_input("talk.mp4", b"raw mp4 bytes");
    let settings = Settings::new().with("compress", true);

    let first = harness.pipeline.execute(&locator, &settings, false).unwrap();
    let second = harness.pipeline.execute(&locator, &settings, false).unwrap();
    assert_eq!(*harness.media.transcodes.lock().unwrap(), 1);
    assert_eq!(first[0].filename, second[0].filename);
    assert_ne!(
        first[0].filename.as_deref(),
        Some(format!("{}.mp4", hash_bytes(b"raw mp4 bytes")).as_str())
    );
    assert_eq!(first[0].original_filename.as_deref(), Some("talk.mp4"));
}

#[test]
fn distinct_locators_run_concurrently() {
    let harness = Harness::new();
    let locators = (0..8)
        .map(|i| {
            let mut content = SRT.to_vec();
            content.extend_from_slice(
                format!("\n3\n00:00:05,000 --> 00:00:06,000\nline {i}\n").as_bytes(),
            );
            harness.write_input(&format!("doc-{i}.srt"), &content)
        })
        .collect::<Vec<_>>();
    let settings = Settings::new().with("language", "fr");

    let results: Vec<Vec<FileMetadata>> = thread::scope(|scope| {
        let handles = locators
            .iter()
            .map(|locator| {
                let pipeline = &harness.pipeline;
                let settings = &settings;
                scope.spawn(move || pipeline.execute(locator, settings, false).unwrap())
            })
            .collect::<Vec<_>>();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let mut names = results
        .iter()
        .map(|records| records[0].filename.clone().unwrap())
        .collect::<Vec<_>>();
    for name in &names {
        assert!(harness.pipeline.verify(name).unwrap());
    }
    names.sort();
    names.dedup();
    assert_eq!(names.len(), locators.len());
}

#[test]
fn standard_stages_keep_dispatch_order() {
    let harness = Harness::new();
    let stages = harness.pipeline.stages();
    let roles = stages.iter().map(Stage::role).collect::<Vec<_>>();
    assert_eq!(
        roles,
        vec![
            StageRole::Download,
            StageRole::Convert,
            StageRole::ExtractMetadata
        ]
    );
    assert_eq!(
        stages[0].handler_names(),
        vec!["disk", "inline", "drive", "video_host", "web"]
    );
    assert_eq!(
        stages[1].handler_names(),
        vec![
            "video", "audio", "subtitles", "image", "svg", "pdf", "epub", "html5", "h5p", "bloom"
        ]
    );
    assert_eq!(stages[2].handler_names(), vec!["extract"]);
}

struct FailingHandler {
    error: fn() -> PipelineError,
}

impl FileHandler for FailingHandler {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn should_handle(&self, _path: &str) -> bool {
        true
    }

    fn handled_errors(&self) -> &'static [ErrorKind] {
        &[ErrorKind::InvalidFile]
    }

    fn handle_file(
        &self,
        _path: &str,
        _settings: &Settings,
        _skip_cache: bool,
        _ws: &Workspace,
    ) -> Result<Vec<FileMetadata>, PipelineError> {
        Err((self.error)())
    }
}

#[test]
fn only_declared_error_kinds_are_recorded() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let ws = Workspace::new(
        Storage::new(root.join("storage")),
        FileCache::new(root.join("cache")),
    );

    let expected = Stage::new(
        StageRole::Convert,
        vec![Box::new(FailingHandler {
            error: || PipelineError::invalid_file("a.pdf", "broken"),
        })],
    );
    assert!(expected.execute("a.pdf", &Settings::new(), false, &ws).is_err());
    assert_eq!(ws.failed.len(), 1);

    let unexpected = Stage::new(
        StageRole::Convert,
        vec![Box::new(FailingHandler {
            error: || PipelineError::Filesystem("disk full".to_string()),
        })],
    );
    let err = unexpected
        .execute("b.pdf", &Settings::new(), false, &ws)
        .unwrap_err();
    assert_matches!(err, PipelineError::Filesystem(_));
    assert_eq!(ws.failed.len(), 1);
    assert!(!ws.failed.contains("b.pdf"));
}

#[test]
fn empty_download_result_is_an_error() {
    struct Silent;

    impl FileHandler for Silent {
        fn name(&self) -> &'static str {
            "silent"
        }

        fn should_handle(&self, _path: &str) -> bool {
            true
        }

        fn handled_errors(&self) -> &'static [ErrorKind] {
            &[]
        }

        fn handle_file(
            &self,
            _path: &str,
            _settings: &Settings,
            _skip_cache: bool,
            _ws: &Workspace,
        ) -> Result<Vec<FileMetadata>, PipelineError> {
            Ok(Vec::new())
        }
    }

    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let ws = Workspace::new(
        Storage::new(root.join("storage")),
        FileCache::new(root.join("cache")),
    );
    let pipeline = Pipeline::new(ws, vec![Stage::new(StageRole::Download, vec![Box::new(Silent)])]);
    let err = pipeline
        .execute("anything", &Settings::new(), false)
        .unwrap_err();
    assert_matches!(err, PipelineError::NoDownloadResult(_));
    assert!(pipeline.failed().contains("anything"));
}

const DRIVE_ID: &str = "1AbCdEfGhIjKlMn";

#[test]
fn mp3_passes_through_with_audio_preset() {
    let harness = Harness::new();
    let locator = harness.write_input("song.mp3", b"mp3 frames");

    let records = harness
        .pipeline
        .execute(&locator, &Settings::new(), false)
        .unwrap();
    assert_eq!(records.len(), 1);
    let expected = format!("{}.mp3", hash_bytes(b"mp3 frames"));
    assert_eq!(records[0].filename.as_deref(), Some(expected.as_str()));
    assert_eq!(records[0].preset, Some(Preset::Audio));
    assert_eq!(records[0].duration, Some(12));
    assert_eq!(*harness.media.transcodes.lock().unwrap(), 0);
}

#[test]
fn mp3_without_audio_stream_is_rejected() {
    let mut media = MockMedia::default();
    media.has_audio = false;
    let harness = Harness::with(MockWeb::default(), media);
    let locator = harness.write_input("silent.mp3", b"not audio");

    let err = harness
        .pipeline
        .execute(&locator, &Settings::new(), false)
        .unwrap_err();
    assert_matches!(err, PipelineError::InvalidFile { .. });
    let failed = harness.pipeline.failed().snapshot();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].handler, "audio");
    assert_eq!(failed[0].locator, locator);
}

#[test]
fn wav_is_transcoded_to_mp3_once() {
    let harness = Harness::new();
    let wav: &[u8] = b"RIFF wave samples";
    let locator = harness.write_input("interview.wav", wav);

    let first = harness
        .pipeline
        .execute(&locator, &Settings::new(), false)
        .unwrap();
    let mut transcoded = wav.to_vec();
    transcoded.extend_from_slice(b"+transcoded");
    let expected = format!("{}.mp3", hash_bytes(&transcoded));
    assert_eq!(first[0].filename.as_deref(), Some(expected.as_str()));
    assert_eq!(first[0].preset, Some(Preset::Audio));
    assert_eq!(*harness.media.transcodes.lock().unwrap(), 1);

    let ws = harness.pipeline.workspace();
    let stored_wav = harness
        .storage()
        .path_for(&format!("{}.wav", hash_bytes(wav)))
        .to_string();
    let key = cache_key(
        CacheOp::Converted,
        &ws.normalize(&stored_wav),
        Some(&AudioContext::default()),
    )
    .unwrap();
    assert_eq!(ws.cache.get(&key).unwrap().as_deref(), Some(expected.as_str()));

    let second = harness
        .pipeline
        .execute(&locator, &Settings::new(), false)
        .unwrap();
    assert_eq!(second[0].filename, first[0].filename);
    assert_eq!(*harness.media.transcodes.lock().unwrap(), 1);

    let lower_bitrate = Settings::new().with("audio_bitrate", "16k");
    harness
        .pipeline
        .execute(&locator, &lower_bitrate, false)
        .unwrap();
    assert_eq!(*harness.media.transcodes.lock().unwrap(), 2);
}

#[test]
fn native_drive_document_is_exported_as_pdf() {
    let pdf = three_page_pdf();
    let harness = Harness::with_drive(MockDrive::serving(
        DRIVE_ID,
        "Lesson plan",
        "application/vnd.google-apps.document",
        &pdf,
    ));
    let locator = format!("https://docs.google.com/document/d/{DRIVE_ID}/edit");

    let records = harness
        .pipeline
        .execute(&locator, &Settings::new(), false)
        .unwrap();
    assert_eq!(records.len(), 1);
    let expected = format!("{}.pdf", hash_bytes(&pdf));
    assert_eq!(records[0].filename.as_deref(), Some(expected.as_str()));
    assert_eq!(records[0].preset, Some(Preset::Document));
    assert_eq!(records[0].original_filename.as_deref(), Some("Lesson plan"));
    assert_eq!(*harness.drive.exports.lock().unwrap(), 1);
    assert_eq!(*harness.drive.downloads.lock().unwrap(), 0);
}

#[test]
fn drive_binary_download_is_keyed_by_default_ext() {
    let harness = Harness::with_drive(MockDrive::serving(
        DRIVE_ID,
        "recording",
        "application/octet-stream",
        b"mp3 frames",
    ));
    let locator = format!("https://drive.google.com/file/d/{DRIVE_ID}/view");

    let err = harness
        .pipeline
        .execute(&locator, &Settings::new(), false)
        .unwrap_err();
    assert_matches!(err, PipelineError::UnsupportedFormat(_));

    let as_mp3 = Settings::new().with("default_ext", "mp3");
    let first = harness.pipeline.execute(&locator, &as_mp3, false).unwrap();
    let expected = format!("{}.mp3", hash_bytes(b"mp3 frames"));
    assert_eq!(first[0].filename.as_deref(), Some(expected.as_str()));
    assert_eq!(first[0].original_filename.as_deref(), Some("recording"));
    assert_eq!(first[0].preset, Some(Preset::Audio));
    assert_eq!(*harness.drive.downloads.lock().unwrap(), 1);

    let cached = harness.pipeline.execute(&locator, &as_mp3, false).unwrap();
    assert_eq!(cached[0].filename, first[0].filename);
    assert_eq!(cached[0].original_filename.as_deref(), Some("recording"));
    assert_eq!(*harness.drive.downloads.lock().unwrap(), 1);

    let as_wav = Settings::new().with("default_ext", "wav");
    let refetched = harness.pipeline.execute(&locator, &as_wav, false).unwrap();
    assert!(refetched[0].filename.as_deref().unwrap().ends_with(".mp3"));
    assert_eq!(*harness.drive.downloads.lock().unwrap(), 2);
    assert_eq!(*harness.drive.exports.lock().unwrap(), 0);
}

#[test]
fn subtitles_only_skips_the_video() {
    let harness = Harness::new();
    let settings = Settings::new()
        .with("subtitles_only", true)
        .with("subtitle_languages", serde_json::json!(["en"]));

    let records = harness
        .pipeline
        .execute("https://www.youtube.com/watch?v=abc123", &settings, false)
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].language.as_deref(), Some("en"));
    assert_eq!(records[0].preset, Some(Preset::VideoSubtitle));
    assert_eq!(*harness.video_host.videos.lock().unwrap(), 0);
    assert_eq!(*harness.video_host.subtitles.lock().unwrap(), 1);
}

#[test]
fn changing_max_height_fetches_hosted_video_again() {
    let harness = Harness::new();
    let locator = "https://www.youtube.com/watch?v=abc123";
    let taller = Settings::new().with("max_height", 720);

    harness.pipeline.execute(locator, &Settings::new(), false).unwrap();
    harness.pipeline.execute(locator, &Settings::new(), false).unwrap();
    assert_eq!(*harness.video_host.videos.lock().unwrap(), 1);

    harness.pipeline.execute(locator, &taller, false).unwrap();
    assert_eq!(*harness.video_host.videos.lock().unwrap(), 2);
    harness.pipeline.execute(locator, &taller, false).unwrap();
    assert_eq!(*harness.video_host.videos.lock().unwrap(), 2);
}

#[test]
fn explicit_preset_is_kept() {
    let harness = Harness::with(MockWeb::default(), MockMedia::new(1080, Some(30.0)));
    let locator = harness.write_input("talk.mp4", b"tall video bytes");
    let settings = Settings::new().with("preset", "low_res_video");

    let records = harness.pipeline.execute(&locator, &settings, false).unwrap();
    assert_eq!(records[0].preset, Some(Preset::LowResVideo));
    assert_eq!(records[0].duration, Some(30));
}

#[test]
fn content_kind_drops_disallowed_preset() {
    let harness = Harness::new();
    let locator = harness.write_input("sample.pdf", &three_page_pdf());

    let as_video = Settings::new().with("kind", "video");
    let records = harness.pipeline.execute(&locator, &as_video, false).unwrap();
    assert_eq!(records[0].preset, None);
    assert!(records[0].filename.as_deref().unwrap().ends_with(".pdf"));

    let as_document = Settings::new().with("kind", "document");
    let records = harness
        .pipeline
        .execute(&locator, &as_document, false)
        .unwrap();
    assert_eq!(records[0].preset, Some(Preset::Document));
}
