//! Scenario: work log survives restart and detects tampering
//!
//! GREEN when:
//! - Reopening a log resumes the sequence counter and hash chain from the last
//!   line, so the combined file still verifies.
//! - Units left open before the restart are still reported open, but the new
//!   process cannot close them.
//! - Mutating a line's message breaks verification at that line.

use otx_audit::{open_units, verify_chain, AuditUnitTracker, ChainCheck, WorkLog};

#[tokio::test]
async fn reopened_log_continues_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("work.jsonl");

    let left_open = {
        let log = WorkLog::open(&path, "alienvault", true).unwrap();
        let a = log.open("run a").await.unwrap();
        log.close(&a, "a ok").await.unwrap();
        let b = log.open("run b").await.unwrap();
        log.report_error(&b, "boom").await.unwrap();
        b
    };

    let log = WorkLog::open(&path, "alienvault", true).unwrap();
    assert_eq!(log.seq().await, 4, "sequence must resume after the last record");
    assert_eq!(log.in_flight().await, 0);

    let open = open_units(&path).unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].unit_id, left_open);
    assert_eq!(open[0].errors, vec!["boom".to_string()]);

    assert!(log.close(&left_open, "closed after restart").await.is_err());

    let c = log.open("run c").await.unwrap();
    log.close(&c, "c ok").await.unwrap();

    assert_eq!(
        verify_chain(&path).unwrap(),
        ChainCheck::Intact { records: 6 }
    );
    assert_eq!(open_units(&path).unwrap().len(), 1);
}

#[tokio::test]
async fn tampered_message_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("work.jsonl");

    {
        let log = WorkLog::open(&path, "alienvault", true).unwrap();
        for i in 0..3 {
            let u = log.open(&format!("run {i}")).await.unwrap();
            log.close(&u, &format!("summary {i}")).await.unwrap();
        }
    }

    let content = std::fs::read_to_string(&path).unwrap();
    let tampered: Vec<String> = content
        .lines()
        .enumerate()
        .map(|(i, l)| {
            if i == 3 {
                l.replace("summary 1", "summary X")
            } else {
                l.to_string()
            }
        })
        .collect();
    std::fs::write(&path, tampered.join("\n")).unwrap();

    match verify_chain(&path).unwrap() {
        ChainCheck::Broken { line, reason } => {
            assert_eq!(line, 4);
            assert!(reason.contains("digest mismatch"), "{reason}");
        }
        other => panic!("expected a broken chain, got {other:?}"),
    }
}

#[tokio::test]
async fn resume_reads_last_line_without_trailing_newline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("work.jsonl");

    {
        let log = WorkLog::open(&path, "alienvault", true).unwrap();
        let u = log.open("run").await.unwrap();
        log.close(&u, "ok").await.unwrap();
    }
    let trimmed = std::fs::read_to_string(&path).unwrap().trim_end().to_string();
    std::fs::write(&path, trimmed).unwrap();

    let log = WorkLog::open(&path, "alienvault", true).unwrap();
    assert_eq!(log.seq().await, 2);
}
