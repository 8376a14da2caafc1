//! End-to-end runs of the standalone pipeline over the in-memory broker and
//! catalogue
//!
//! ```bash
//! cargo test -p sda-pipeline --test pipeline_tests
//! ```

mod common;

use common::{read_all, sha256, Pipeline, Step, ERROR_ROUTE};
use proptest::prelude::*;
use sda_common::messages::{DatasetMessage, InfoError};
use sda_pipeline::broker::memory::Settlement;
use sda_pipeline::catalogue::{Catalogue, ChecksumSource, FileEvent, FileState};
use sda_pipeline::crypt4gh::{self, KeyPair};
use sda_pipeline::service::{Stage, Verdict};
use sda_pipeline::stages::{
    HeaderCopy, ROUTE_ACCESSION, ROUTE_ARCHIVED, ROUTE_COMPLETED, ROUTE_INGEST, ROUTE_MAPPINGS, ROUTE_VERIFIED,
};
use serde_json::json;
use uuid::Uuid;

const PLAIN: &[u8] = b"ACGTACGTTTGACCA\nGATTACA\n";

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_happy_path_reaches_ready() {
    let p = Pipeline::new().await;
    let stages = p.stages(None);
    p.submit("u1", "u1/a.c4gh", PLAIN, "corr-s1").await;

    p.run_to_ready(&stages).await;

    let record = p.catalogue.find_by_path("u1", "u1/a.c4gh").await.unwrap();
    assert_eq!(record.state, FileState::Ready);
    assert_eq!(record.decrypted_file_size, Some(PLAIN.len() as u64));

    let accession = record.stable_id.clone().unwrap();
    let uuid = accession.strip_prefix("urn:u1:").unwrap();
    assert_eq!(Uuid::parse_str(uuid).unwrap().get_version_num(), 4);

    let mapping = p.broker.published_to(ROUTE_MAPPINGS).await;
    let message: DatasetMessage = serde_json::from_slice(&mapping[0].body).unwrap();
    let DatasetMessage::Mapping { dataset_id, .. } = message else {
        panic!("expected a mapping");
    };
    assert_eq!(p.catalogue.dataset_accessions(&dataset_id).await.unwrap(), vec![accession]);

    let archive_path = record.archive_file_path.unwrap();
    let archived = read_all(p.archive.as_ref(), &archive_path).await;
    let backed_up = read_all(p.backup.as_ref(), &archive_path).await;
    assert_eq!(archived.len(), backed_up.len());
    assert_eq!(archived, backed_up);

    // Every hop carries the submission's correlation id
    for message in p.broker.published().await {
        assert_eq!(message.correlation_id, "corr-s1");
    }
}

#[tokio::test]
async fn test_bad_schema_is_dropped_with_info_error() {
    let p = Pipeline::new().await;
    let stages = p.stages(None);
    let body = br#"{"filepath":"x"}"#.to_vec();
    let tag = p.broker.deliver("files", "corr-s2", ROUTE_INGEST, body.clone()).await;

    let (_, verdict) = p.step(&stages.ingest, "files").await;

    assert_eq!(verdict, Verdict::Drop);
    assert_eq!(p.broker.settlement(tag).await, Some(Settlement::Nack { requeue: false }));
    let errors = p.broker.published_to(ERROR_ROUTE).await;
    assert_eq!(errors.len(), 1);
    let info: InfoError = serde_json::from_slice(&errors[0].body).unwrap();
    assert_eq!(info.original_bytes().unwrap(), body);
    assert_eq!(p.catalogue.file_count().await, 0);
}

#[tokio::test]
async fn test_lost_confirm_after_archiving_republishes_without_recopy() {
    let p = Pipeline::new().await;
    let stages = p.stages(None);
    p.submit("u1", "u1/a.c4gh", PLAIN, "corr-s3").await;

    p.broker.reject_publishes(true);
    let (delivery, verdict) = p.step(&stages.ingest, ROUTE_INGEST).await;
    assert_eq!(verdict, Verdict::Requeue);

    let record = p.catalogue.find_by_path("u1", "u1/a.c4gh").await.unwrap();
    assert_eq!(record.state, FileState::Archived);
    let archive_path = record.archive_file_path.unwrap();
    let archived = read_all(p.archive.as_ref(), &archive_path).await;

    // Anything read from the inbox now would not decrypt
    let mut writer = p.inbox.open_write("u1/a.c4gh").await.unwrap();
    writer.write(b"garbage").await.unwrap();
    writer.finish().await.unwrap();

    p.broker.reject_publishes(false);
    p.redeliver(&delivery).await;
    let (_, verdict) = p.step(&stages.ingest, ROUTE_INGEST).await;

    assert_eq!(verdict, Verdict::Ack);
    assert_eq!(read_all(p.archive.as_ref(), &archive_path).await, archived);
    assert_eq!(p.broker.published_to(ROUTE_ARCHIVED).await.len(), 1);
    assert_eq!(p.step(&stages.verify, ROUTE_ARCHIVED).await.1, Verdict::Ack);
}

#[tokio::test]
async fn test_corrupt_header_fails_verification_permanently() {
    let p = Pipeline::new().await;
    let stages = p.stages(None);
    p.submit("u1", "u1/a.c4gh", PLAIN, "corr-s4").await;
    assert_eq!(p.step(&stages.ingest, ROUTE_INGEST).await.1, Verdict::Ack);

    let file_id = p.catalogue.find_by_path("u1", "u1/a.c4gh").await.unwrap().id;
    p.catalogue.corrupt_header(file_id, &[0x42]).await.unwrap();

    let (_, verdict) = p.step(&stages.verify, ROUTE_ARCHIVED).await;

    assert_eq!(verdict, Verdict::Drop);
    assert_eq!(p.broker.published_to(ERROR_ROUTE).await.len(), 1);
    assert_eq!(p.catalogue.file(file_id).await.unwrap().state, FileState::Archived);
    let events = p.catalogue.file_events(file_id).await.unwrap();
    assert!(events.iter().all(|e| e.event != FileEvent::Verified));
}

#[tokio::test]
async fn test_partial_dataset_mapping_waits() {
    let p = Pipeline::new().await;
    let stages = p.stages(None);
    p.submit("u1", "u1/a.c4gh", PLAIN, "corr-s5").await;
    for (stage_queue, verdict) in [
        (ROUTE_INGEST, p.step(&stages.ingest, ROUTE_INGEST).await.1),
        (ROUTE_ARCHIVED, p.step(&stages.verify, ROUTE_ARCHIVED).await.1),
        ("verified", p.step(&stages.orchestrate, "verified").await.1),
        (ROUTE_ACCESSION, p.step(&stages.finalize, ROUTE_ACCESSION).await.1),
    ] {
        assert_eq!(verdict, Verdict::Ack, "{stage_queue}");
    }
    let record = p.catalogue.find_by_path("u1", "u1/a.c4gh").await.unwrap();
    let accession = record.stable_id.unwrap();

    let mapping = json!({
        "type": "mapping",
        "dataset_id": "EGAD00000000001",
        "accession_ids": [accession, "A2-missing"]
    });
    p.broker
        .deliver(ROUTE_MAPPINGS, "corr-s5", ROUTE_MAPPINGS, serde_json::to_vec(&mapping).unwrap())
        .await;
    let (_, verdict) = p.step(&stages.mapper, ROUTE_MAPPINGS).await;

    assert_eq!(verdict, Verdict::Requeue);
    assert!(p.catalogue.dataset_accessions("EGAD00000000001").await.is_err());
    assert_eq!(p.catalogue.file(record.id).await.unwrap().state, FileState::Completed);
    assert!(p.broker.published_to(ERROR_ROUTE).await.is_empty());
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn test_replaying_every_message_changes_nothing() {
    let p = Pipeline::new().await;
    let stages = p.stages(None);
    p.submit("u1", "u1/a.c4gh", PLAIN, "corr-p1").await;
    let seen = p.run_to_ready(&stages).await;
    let before = p.catalogue.find_by_path("u1", "u1/a.c4gh").await.unwrap();
    let dataset_id = mapped_dataset(&p).await;
    let dataset_events = p.catalogue.dataset_events(&dataset_id).await;
    let ready_events = ready_event_count(&p, before.id).await;
    assert_eq!(ready_events, 1);

    for (step, delivery) in seen {
        let verdict = p.replay(&stages, step, delivery).await;
        assert_ne!(verdict, Verdict::Drop, "{step:?} rejected its own replay");
    }

    assert_eq!(p.catalogue.file_count().await, 1);
    let after = p.catalogue.find_by_path("u1", "u1/a.c4gh").await.unwrap();
    assert_eq!(after, before);
    assert_eq!(p.catalogue.dataset_events(&dataset_id).await, dataset_events);
    assert_eq!(ready_event_count(&p, before.id).await, ready_events);
}

async fn mapped_dataset(p: &Pipeline) -> String {
    let mapping = p.broker.published_to(ROUTE_MAPPINGS).await;
    let message: DatasetMessage = serde_json::from_slice(&mapping[0].body).unwrap();
    match message {
        DatasetMessage::Mapping { dataset_id, .. } => dataset_id,
        other => panic!("expected a mapping, got {other:?}"),
    }
}

async fn ready_event_count(p: &Pipeline, file_id: Uuid) -> usize {
    p.catalogue
        .file_events(file_id)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.event == FileEvent::Ready)
        .count()
}

#[tokio::test]
async fn test_redelivered_accession_request_reaches_finalize_cleanly() {
    let p = Pipeline::new().await;
    let stages = p.stages(None);
    p.submit("u1", "u1/a.c4gh", PLAIN, "corr-p1b").await;
    assert_eq!(p.step(&stages.ingest, ROUTE_INGEST).await.1, Verdict::Ack);
    assert_eq!(p.step(&stages.verify, ROUTE_ARCHIVED).await.1, Verdict::Ack);

    let (request, verdict) = p.step(&stages.orchestrate, ROUTE_VERIFIED).await;
    assert_eq!(verdict, Verdict::Ack);
    p.redeliver(&request).await;
    assert_eq!(p.step(&stages.orchestrate, ROUTE_VERIFIED).await.1, Verdict::Ack);

    let accessions = p.broker.published_to(ROUTE_ACCESSION).await;
    assert_eq!(accessions.len(), 2);
    assert_eq!(accessions[0].body, accessions[1].body);

    assert_eq!(p.step(&stages.finalize, ROUTE_ACCESSION).await.1, Verdict::Ack);
    assert_eq!(p.step(&stages.finalize, ROUTE_ACCESSION).await.1, Verdict::Ack);

    assert!(p.broker.published_to(ERROR_ROUTE).await.is_empty());
    let record = p.catalogue.find_by_path("u1", "u1/a.c4gh").await.unwrap();
    assert_eq!(record.state, FileState::Completed);
    assert!(record.stable_id.unwrap().starts_with("urn:u1:"));
}

#[tokio::test]
async fn test_redelivery_after_unacked_side_effects() {
    let p = Pipeline::new().await;
    let stages = p.stages(None);
    p.submit("u1", "u1/a.c4gh", PLAIN, "corr-p2").await;
    for verdict in [
        p.step(&stages.ingest, ROUTE_INGEST).await.1,
        p.step(&stages.verify, ROUTE_ARCHIVED).await.1,
        p.step(&stages.orchestrate, "verified").await.1,
    ] {
        assert_eq!(verdict, Verdict::Ack);
    }

    // Side effects land, then the handler dies before settling
    let delivery = p.next(ROUTE_ACCESSION).await;
    stages.finalize.handle(&p.context(), &delivery).await.unwrap();
    let accession = p.catalogue.find_by_path("u1", "u1/a.c4gh").await.unwrap().stable_id;

    p.redeliver(&delivery).await;
    assert_eq!(p.step(&stages.finalize, ROUTE_ACCESSION).await.1, Verdict::Ack);

    let record = p.catalogue.find_by_path("u1", "u1/a.c4gh").await.unwrap();
    assert_eq!(record.stable_id, accession);
    assert_eq!(record.state, FileState::Completed);
    assert_eq!(p.catalogue.file_count().await, 1);
}

#[tokio::test]
async fn test_stored_header_and_archive_rebuild_the_upload() {
    let p = Pipeline::new().await;
    let stages = p.stages(None);
    let uploaded = p.submit("u1", "u1/a.c4gh", PLAIN, "corr-p3").await;
    p.run_to_ready(&stages).await;

    let record = p.catalogue.find_by_path("u1", "u1/a.c4gh").await.unwrap();
    let mut assembled = p.catalogue.get_header(record.id).await.unwrap();
    assembled.extend(read_all(p.archive.as_ref(), &record.archive_file_path.unwrap()).await);
    assert_eq!(assembled, uploaded);

    let checksums = p.catalogue.checksums(record.id).await.unwrap();
    let recorded = checksums
        .iter()
        .find(|(source, c)| *source == ChecksumSource::Uploaded && c.algorithm == sda_common::ChecksumAlgorithm::Sha256)
        .map(|(_, c)| c.clone())
        .unwrap();
    assert_eq!(recorded, sha256(&assembled));
}

#[tokio::test]
async fn test_header_copy_backup_is_readable_by_backup_key() {
    let p = Pipeline::new().await;
    let backup_key = KeyPair::generate();
    let stages = p.stages(Some(HeaderCopy {
        service_key: p.key.clone(),
        recipient: backup_key.public_key(),
    }));
    p.submit("u1", "u1/a.c4gh", PLAIN, "corr-p6").await;
    p.run_to_ready(&stages).await;

    let record = p.catalogue.find_by_path("u1", "u1/a.c4gh").await.unwrap();
    let archived = read_all(p.archive.as_ref(), &record.archive_file_path.unwrap()).await;
    let copy = read_all(p.backup.as_ref(), "u1/a.c4gh").await;

    let mut cursor = copy.as_slice();
    let header = crypt4gh::read_header(&mut cursor).await.unwrap();
    assert_eq!(&copy[header.len()..], archived.as_slice());

    let decrypted = crypt4gh::decrypt_header(&header, &backup_key).unwrap();
    let mut plain = Vec::new();
    crypt4gh::decrypt_body(&mut cursor, &decrypted, |chunk| plain.extend_from_slice(chunk))
        .await
        .unwrap();
    assert_eq!(plain, PLAIN);
}

#[tokio::test]
async fn test_backup_waits_for_accession() {
    let p = Pipeline::new().await;
    let stages = p.stages(None);
    let completion = json!({
        "user": "u1",
        "filepath": "u1/never.c4gh",
        "accession_id": "EGAF00000000009",
        "decrypted_checksums": [sha256(b"never")]
    });
    p.broker
        .deliver(ROUTE_COMPLETED, "corr-x", ROUTE_COMPLETED, serde_json::to_vec(&completion).unwrap())
        .await;
    assert_eq!(p.step(&stages.backup, ROUTE_COMPLETED).await.1, Verdict::Requeue);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn test_replays_never_regress_state(order in proptest::collection::vec(0usize..Step::ALL.len(), 1..16)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let p = Pipeline::new().await;
            let stages = p.stages(None);
            p.submit("u1", "u1/a.c4gh", PLAIN, "corr-p5").await;
            let seen = p.run_to_ready(&stages).await;
            let file_id = p.catalogue.find_by_path("u1", "u1/a.c4gh").await.unwrap().id;

            let mut last = p.catalogue.file(file_id).await.unwrap().state;
            for index in order {
                let (step, delivery) = seen[index].clone();
                p.replay(&stages, step, delivery).await;
                let now = p.catalogue.file(file_id).await.unwrap().state;
                assert!(now >= last, "{step:?} moved {last} back to {now}");
                last = now;
            }
        });
    }
}
