mod common;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use base64::Engine;
use base64::engine::general_purpose;
use common::*;
use markscan::server::{
    self, AppState, FrameRequest, LedgerQuery, SaveResponse, ScanResponse,
};

fn data_url(digits: &[u8]) -> String {
    let png = encode_png(&render_row(digits));
    format!("data:image/png;base64,{}", general_purpose::STANDARD.encode(png))
}

fn blank_page_b64() -> String {
    general_purpose::STANDARD.encode(&blank_page_frame().bytes)
}

fn test_state() -> (AppState, tempfile::TempDir) {
    let (scanner, dir) = create_test_scanner();
    let state = AppState::new(scanner, "marks.xlsx", "*").expect("valid origin");
    (state, dir)
}

#[tokio::test]
async fn test_malformed_origin_is_refused() {
    let (scanner, _dir) = create_test_scanner();
    assert!(AppState::new(scanner.clone(), "marks.xlsx", "http://a\nb").is_err());
    assert!(AppState::new(scanner.clone(), "marks.xlsx", "").is_err());

    let state = AppState::new(scanner, "marks.xlsx", "http://localhost:5173").expect("origin");
    assert_eq!(state.allow_origin, "http://localhost:5173");
}

#[tokio::test]
async fn test_state_shares_ledger_with_the_scanner_it_was_built_from() -> anyhow::Result<()> {
    let (scanner, _dir) = create_test_scanner();
    let state = AppState::new(scanner.clone(), "marks.xlsx", "*").expect("valid origin");

    let request = FrameRequest {
        image_b64: data_url(&[7, 9, 4]),
        excel_path: None,
    };
    server::save(State(state), Json(request))
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    assert_eq!(scanner.grand_total("marks.xlsx").await?, 20);
    scanner.ledger().close().await;
    Ok(())
}

#[tokio::test]
async fn test_health_reports_running() -> anyhow::Result<()> {
    let Json(body) = server::health().await;
    assert_eq!(body["status"], "Mark Scanner API is running");
    Ok(())
}

#[tokio::test]
async fn test_scan_returns_results_with_boxes() -> anyhow::Result<()> {
    let (state, _dir) = test_state();
    let request = FrameRequest {
        image_b64: data_url(&[7, 9, 4]),
        excel_path: None,
    };

    let Json(response) = server::scan(State(state), Json(request))
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    let ScanResponse::Detected { success, count, results } = response else {
        panic!("expected detection");
    };
    assert!(success);
    assert_eq!(count, 3);
    let digits: Vec<u8> = results.iter().map(|r| r.digit).collect();
    assert_eq!(digits, vec![7, 9, 4]);
    assert!(results.iter().all(|r| r.bounds[2] > 0 && r.bounds[3] > 0));
    Ok(())
}

#[tokio::test]
async fn test_save_uses_default_path_and_reports_totals() -> anyhow::Result<()> {
    let (state, dir) = test_state();

    for (digits, expected_grand) in [(vec![7u8, 9, 4], 20u64), (vec![1, 1], 22)] {
        let request = FrameRequest {
            image_b64: data_url(&digits),
            excel_path: None,
        };
        let Json(response) = server::save(State(state.clone()), Json(request))
            .await
            .map_err(|e| anyhow::anyhow!("{e:?}"))?;
        let SaveResponse::Saved { success, marks, row_total, grand_total, .. } = response else {
            panic!("expected save");
        };
        assert!(success);
        assert_eq!(marks, digits);
        assert_eq!(row_total, digits.iter().map(|&d| d as u32).sum::<u32>());
        assert_eq!(grand_total, expected_grand);
    }
    assert!(dir.path().join("marks.xlsx.sqlite").is_file());

    let Json(ledger) = server::ledger(State(state), Query(LedgerQuery { excel_path: None }))
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    assert_eq!(ledger.grand_total, 22);
    assert_eq!(ledger.entries.len(), 2);
    assert_eq!(ledger.entries[0].marks, vec![7, 9, 4]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ledger_view_total_matches_its_entries_during_appends() -> anyhow::Result<()> {
    let (state, _dir) = test_state();

    let writer = {
        let state = state.clone();
        tokio::spawn(async move {
            for i in 0..40u8 {
                state
                    .scanner
                    .ledger()
                    .append("marks.xlsx", &Row::from_marks(vec![i % 10, 1]))
                    .await
                    .expect("append");
            }
        })
    };

    while !writer.is_finished() {
        let Json(view) =
            server::ledger(State(state.clone()), Query(LedgerQuery { excel_path: None }))
                .await
                .map_err(|e| anyhow::anyhow!("{e:?}"))?;
        let listed: u64 = view.entries.iter().map(|e| e.row_total as u64).sum();
        assert_eq!(view.grand_total, listed);
    }
    writer.await?;

    let Json(view) = server::ledger(State(state), Query(LedgerQuery { excel_path: None }))
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    assert_eq!(view.entries.len(), 40);
    assert_eq!(view.grand_total, 4 * 45 + 40);
    Ok(())
}

#[tokio::test]
async fn test_no_detection_is_a_successful_response() -> anyhow::Result<()> {
    let (state, _dir) = test_state();

    let request = FrameRequest {
        image_b64: blank_page_b64(),
        excel_path: Some("marks.xlsx".to_string()),
    };
    let Json(response) = server::save(State(state.clone()), Json(request))
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    let json = serde_json::to_value(&response)?;
    assert_eq!(json["success"], false);
    assert_eq!(json["message"], "No digits detected");
    assert_eq!(json["reason"], "table_not_found");
    assert_eq!(state.scanner.grand_total("marks.xlsx").await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_traversal_path_is_a_bad_request() -> anyhow::Result<()> {
    let (state, _dir) = test_state();
    let request = FrameRequest {
        image_b64: data_url(&[1]),
        excel_path: Some("../outside.xlsx".to_string()),
    };
    let err = server::save(State(state), Json(request))
        .await
        .expect_err("must reject");
    assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_storage_failure_is_distinct_from_no_detection() -> anyhow::Result<()> {
    let (state, dir) = test_state();
    std::fs::write(dir.path().join("marks.xlsx.sqlite"), "garbage ".repeat(200))?;

    let request = FrameRequest {
        image_b64: data_url(&[7, 9, 4]),
        excel_path: None,
    };
    let err = server::save(State(state), Json(request))
        .await
        .expect_err("storage failure");
    let response = err.into_response();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let json: serde_json::Value = serde_json::from_slice(&bytes)?;
    assert_eq!(json["error"], "persistence");
    assert_eq!(json["marks"], serde_json::json!([7, 9, 4]));
    Ok(())
}
