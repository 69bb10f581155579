mod common;

use std::io::Read;
use std::path::PathBuf;

use axum::http::{HeaderMap, StatusCode};
use common::{client, setup_temp_dir, start};
use flate2::read::GzDecoder;
use oneshot::commands::{
    ReceiveHandler, ReceiveOptions, RedirectHandler, SendHandler, SendOptions,
};
use oneshot::server::{ArbiterConfig, Conclusion, Credentials};
use oneshot::transfer::{ArchiveMethod, TransferReader, TransferWriter};

//===============
// Send
//===============

#[tokio::test]
async fn send_single_file_then_gone() {
    let temp = setup_temp_dir();
    let path = temp.path().join("greeting.txt");
    std::fs::write(&path, "hello there").unwrap();

    let handler = SendHandler::new(TransferReader::new(vec![path]), SendOptions::default());
    let running = start(handler, ArbiterConfig::default()).await;
    let client = client();

    let response = client.get(running.url("/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(
        response.headers()["content-disposition"],
        "attachment;filename=\"greeting.txt\""
    );
    assert_eq!(response.text().await.unwrap(), "hello there");

    let (summary, report) = running.finish().await;
    assert_eq!(summary.conclusion, Conclusion::Succeeded);
    let file = report.success.unwrap().file.unwrap();
    assert_eq!(file.name, "greeting.txt");
    assert_eq!(file.transfer_size, 11);
}

#[tokio::test]
async fn send_tar_gz_of_two_files_extracts_exactly() {
    let temp = setup_temp_dir();
    let a = temp.path().join("a.txt");
    let b = temp.path().join("b.txt");
    std::fs::write(&a, "X").unwrap();
    std::fs::write(&b, "YY").unwrap();

    let reader = TransferReader::new(vec![a, b])
        .with_name(Some("bundle".into()))
        .with_archive_method(ArchiveMethod::TarGz);
    let running = start(SendHandler::new(reader, SendOptions::default()), ArbiterConfig::default()).await;

    let response = client().get(running.url("/")).send().await.unwrap();
    assert_eq!(
        response.headers()["content-disposition"],
        "attachment;filename=\"bundle.tar.gz\""
    );
    let bytes = response.bytes().await.unwrap();

    let mut archive = tar::Archive::new(GzDecoder::new(&bytes[..]));
    let mut entries: Vec<(PathBuf, String)> = archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().into_owned();
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            (path, content)
        })
        .collect();
    entries.sort();
    assert_eq!(
        entries,
        vec![
            (PathBuf::from("a.txt"), "X".to_string()),
            (PathBuf::from("b.txt"), "YY".to_string()),
        ]
    );
    running.finish().await;
}

#[tokio::test]
async fn send_zip_of_directory() {
    let temp = setup_temp_dir();
    let dir = temp.path().join("photos");
    std::fs::create_dir(&dir).unwrap();
    std::fs::write(dir.join("one.jpg"), "1").unwrap();

    let reader = TransferReader::new(vec![dir]).with_archive_method(ArchiveMethod::Zip);
    let running = start(SendHandler::new(reader, SendOptions::default()), ArbiterConfig::default()).await;

    let response = client().get(running.url("/")).send().await.unwrap();
    assert_eq!(response.headers()["content-type"], "application/zip");
    let bytes = response.bytes().await.unwrap();

    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
    assert_eq!(zip.len(), 1);
    assert_eq!(zip.by_index(0).unwrap().name(), "photos/one.jpg");
    running.finish().await;
}

//===============
// Receive
//===============

#[tokio::test]
async fn receive_success_writes_seven_byte_file() {
    let temp = setup_temp_dir();
    let writer = TransferWriter::to_dir(temp.path()).with_name(Some("result.txt".into()));
    let handler = ReceiveHandler::new(writer, ReceiveOptions::default());
    let running = start(handler, ArbiterConfig::default()).await;

    let response = client()
        .post(running.url("/"))
        .header("content-type", "application/octet-stream")
        .body("SUCCESS")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (_, report) = running.finish().await;
    let written = std::fs::read(temp.path().join("result.txt")).unwrap();
    assert_eq!(written.len(), 7);
    assert_eq!(written, b"SUCCESS");
    assert_eq!(report.success.unwrap().file.unwrap().transfer_size, 7);
}

#[tokio::test]
async fn receive_form_page_does_not_use_up_exchange() {
    let temp = setup_temp_dir();
    let handler = ReceiveHandler::new(TransferWriter::to_dir(temp.path()), ReceiveOptions::default());
    let running = start(handler, ArbiterConfig::default()).await;
    let client = client();

    let page = client.get(running.url("/")).send().await.unwrap();
    assert_eq!(page.status(), StatusCode::OK);
    assert!(page.text().await.unwrap().contains("<form"));

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(b"payload".to_vec()).file_name("upload.bin"),
    );
    let response = client.post(running.url("/")).multipart(form).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (summary, report) = running.finish().await;
    assert_eq!(summary.conclusion, Conclusion::Succeeded);
    assert!(report.attempts.is_empty());
    assert_eq!(std::fs::read(temp.path().join("upload.bin")).unwrap(), b"payload");
}

#[tokio::test]
async fn receive_bad_csrf_then_good_upload() {
    let temp = setup_temp_dir();
    let handler = ReceiveHandler::new(
        TransferWriter::to_dir(temp.path()).with_name(Some("note.txt".into())),
        ReceiveOptions {
            csrf_token: Some("token123".into()),
            ..Default::default()
        },
    );
    let running = start(handler, ArbiterConfig::default()).await;
    let client = client();

    let rejected = client
        .post(running.url("/"))
        .header("x-csrf-token", "wrong")
        .body("nope")
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
    assert!(!temp.path().join("note.txt").exists());

    let accepted = client
        .post(running.url("/"))
        .header("x-csrf-token", "token123")
        .body("fine")
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::OK);

    let (summary, report) = running.finish().await;
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(std::fs::read_to_string(temp.path().join("note.txt")).unwrap(), "fine");
}

//===============
// Redirect, auth and bots
//===============

#[tokio::test]
async fn redirect_answers_307_with_location() {
    let handler =
        RedirectHandler::new("https://example.test/", StatusCode::TEMPORARY_REDIRECT, HeaderMap::new())
            .unwrap();
    let running = start(handler, ArbiterConfig::default()).await;

    let response = client().get(running.url("/anything")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(response.headers()["location"], "https://example.test/");

    let (summary, _) = running.finish().await;
    assert_eq!(summary.conclusion, Conclusion::Succeeded);
}

#[tokio::test]
async fn unauthenticated_requests_never_reach_the_handler() {
    let handler = SendHandler::new(
        TransferReader::from_bytes("secret.txt", &b"classified"[..]),
        SendOptions::default(),
    );
    let config = ArbiterConfig {
        credentials: Some(Credentials {
            username: Some("alice".into()),
            password: Some("pw".into()),
        }),
        ..Default::default()
    };
    let running = start(handler, config).await;
    let client = client();

    let denied = client.get(running.url("/")).send().await.unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    assert!(denied.headers().contains_key("www-authenticate"));

    let wrong = client
        .get(running.url("/"))
        .basic_auth("alice", Some("nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let allowed = client
        .get(running.url("/"))
        .basic_auth("alice", Some("pw"))
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
    assert_eq!(allowed.text().await.unwrap(), "classified");

    let (summary, report) = running.finish().await;
    assert!(summary.failures.is_empty());
    assert!(report.attempts.is_empty());
}

#[tokio::test]
async fn link_preview_bots_get_empty_ok() {
    let handler = SendHandler::new(
        TransferReader::from_bytes("doc.txt", &b"content"[..]),
        SendOptions::default(),
    );
    let running = start(handler, ArbiterConfig::default()).await;
    let client = client();

    let bot = client
        .get(running.url("/"))
        .header("user-agent", "Slackbot-LinkExpanding 1.0")
        .send()
        .await
        .unwrap();
    assert_eq!(bot.status(), StatusCode::OK);
    assert!(bot.text().await.unwrap().is_empty());

    let human = client.get(running.url("/")).send().await.unwrap();
    assert_eq!(
        human.headers()["cache-control"],
        "no-cache, no-store, must-revalidate"
    );
    assert_eq!(human.text().await.unwrap(), "content");

    let (summary, _) = running.finish().await;
    assert_eq!(summary.conclusion, Conclusion::Succeeded);
}
