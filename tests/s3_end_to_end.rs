//! Pack runs against a mocked S3 endpoint
//!
//! Exercises the real HTTP store: delimited listing, object reads and the
//! multipart upload sequence, with the archive captured from the mock.

mod common;

use std::sync::Arc;

use common::{entry_names, read_entries};
use s3packer::{Config, Error, Packer, PipelineConfig, S3Store, StoreConfig};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DOCS: [(&str, &str); 2] = [
    ("docs/guide.md", "# Guide\n\nRead me first.\n"),
    ("docs/notes.txt", "remember the milk"),
];

fn list_body() -> String {
    let contents: String = DOCS
        .iter()
        .map(|(key, body)| {
            format!(
                "<Contents><Key>{key}</Key><LastModified>2024-01-01T00:00:00.000Z</LastModified>\
                 <ETag>&quot;{:x}&quot;</ETag><Size>{}</Size><StorageClass>STANDARD</StorageClass></Contents>",
                md5::compute(body),
                body.len()
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>library</Name>
  <Prefix>docs/</Prefix>
  <KeyCount>{}</KeyCount>
  <MaxKeys>1000</MaxKeys>
  <Delimiter>/</Delimiter>
  <IsTruncated>false</IsTruncated>
  {contents}
</ListBucketResult>"#,
        DOCS.len()
    )
}

async fn library_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/library/"))
        .and(query_param("prefix", "docs/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(list_body()))
        .mount(&server)
        .await;
    for (key, body) in DOCS {
        Mock::given(method("GET"))
            .and(path(format!("/library/{key}")))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;
    }
    server
}

fn packer_for(server: &MockServer) -> Packer {
    let config = Config {
        store: StoreConfig {
            endpoint: Some(server.uri()),
            access_key_id: Some("AKIDEXAMPLE".to_string()),
            secret_access_key: Some("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string()),
            ..StoreConfig::default()
        },
        pipeline: PipelineConfig::default(),
    };
    config.validate().unwrap();
    let store = Arc::new(S3Store::new(config.store).unwrap());
    Packer::new(store, config.pipeline).unwrap()
}

#[tokio::test]
async fn packs_listed_objects_into_a_local_file() {
    let server = library_server().await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("docs.zip");

    let summary = packer_for(&server)
        .pack(dest.to_str().unwrap(), &["s3://library/docs/"])
        .await
        .unwrap();

    assert_eq!(summary.entries(), 2);
    assert_eq!(summary.fetch.verified, 2);
    let mut entries = read_entries(&std::fs::read(&dest).unwrap());
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    for (entry, (key, body)) in entries.iter().zip(DOCS) {
        assert_eq!(entry.name, key);
        assert_eq!(entry.data, body.as_bytes());
    }
}

#[tokio::test]
async fn uploads_the_archive_as_a_multipart_object() {
    let server = library_server().await;
    Mock::given(method("POST"))
        .and(path("/shelf/docs.zip"))
        .and(query_param("uploadId", "up-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<CompleteMultipartUploadResult><Key>docs.zip</Key></CompleteMultipartUploadResult>",
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/shelf/docs.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<InitiateMultipartUploadResult><Bucket>shelf</Bucket><Key>docs.zip</Key>\
             <UploadId>up-1</UploadId></InitiateMultipartUploadResult>",
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/shelf/docs.zip"))
        .and(query_param("partNumber", "1"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"part-1\""))
        .expect(1)
        .mount(&server)
        .await;

    let summary = packer_for(&server)
        .pack("s3://shelf/docs.zip", &["s3://library/docs/"])
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let part = requests
        .iter()
        .find(|r| r.method.as_str() == "PUT")
        .expect("part upload request");
    assert_eq!(part.body.len() as u64, summary.archive_bytes());
    let mut names = entry_names(&part.body);
    names.sort();
    assert_eq!(names, vec!["docs/guide.md", "docs/notes.txt"]);
}

#[tokio::test]
async fn denied_listing_aborts_the_upload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/library/"))
        .respond_with(
            ResponseTemplate::new(403)
                .set_body_string("<Error><Code>AccessDenied</Code></Error>"),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/shelf/docs.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<InitiateMultipartUploadResult><Bucket>shelf</Bucket><Key>docs.zip</Key>\
             <UploadId>up-2</UploadId></InitiateMultipartUploadResult>",
        ))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/shelf/docs.zip"))
        .and(query_param("uploadId", "up-2"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let result = packer_for(&server)
        .pack("s3://shelf/docs.zip", &["s3://library/docs/"])
        .await;

    match result {
        Err(Error::Listing { source, .. }) => {
            assert!(source.to_string().contains("403"), "source: {source}");
        }
        other => panic!("expected Listing error, got {other:?}"),
    }
}

#[tokio::test]
async fn kms_encrypted_object_is_not_rejected_by_its_etag() {
    let server = MockServer::start().await;
    let listing = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>vault</Name>
  <Prefix>d/</Prefix>
  <KeyCount>1</KeyCount>
  <MaxKeys>1000</MaxKeys>
  <Delimiter>/</Delimiter>
  <IsTruncated>false</IsTruncated>
  <Contents><Key>d/a.txt</Key><LastModified>2024-01-01T00:00:00.000Z</LastModified><ETag>&quot;0123456789abcdef0123456789abcdef&quot;</ETag><Size>5</Size><StorageClass>STANDARD</StorageClass></Contents>
</ListBucketResult>"#;
    Mock::given(method("GET"))
        .and(path("/vault/"))
        .and(query_param("prefix", "d/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/vault/d/a.txt"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-amz-server-side-encryption", "aws:kms")
                .set_body_string("hello"),
        )
        .expect(1)
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("vault.zip");

    let summary = packer_for(&server)
        .pack(dest.to_str().unwrap(), &["s3://vault/d/"])
        .await
        .unwrap();

    assert_eq!(summary.entries(), 1);
    assert_eq!(summary.fetch.verified, 0);
    let entries = read_entries(&std::fs::read(&dest).unwrap());
    assert_eq!(entries[0].name, "d/a.txt");
    assert_eq!(entries[0].data, b"hello");
}
