use futures::future::BoxFuture;
use futures::FutureExt;
use rust_xlsxwriter::Workbook;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use variance_intake::routing::after_llm_failure;
use variance_intake::*;

const BUDGET_CSV: &str = "\
Project,Period,Category,Cost Code,Budget,Actual
Tower A,2024-03,Civil,CC-100,1000000,1150000
Tower A,2024-03,MEP,CC-200,500000,480000
";

const CHANGE_ORDERS_CSV: &str = "\
CO ID,Project,Date,Linked Cost Code,Amount,Description,File Link
CO-1,Tower A,2024-03-12,CC-100,100000,Extra slab,https://files/co1.pdf
";

const VENDOR_MAP_CSV: &str = "\
Vendor,Canonical Vendor,Project,Cost Code
Acme Trading Est.,Acme,Tower A,CC-100
";

const CATEGORY_MAP_CSV: &str = "\
Cost Code,Category
CC-100,Civil
CC-200,MEP
";

const MEMO: &str = "Cost review for Tower A, March 2024\nFacade: budget 500,000 and actual 620,000\n";

fn file(name: &str, body: &str) -> UploadedFile {
    UploadedFile::new(name, body.as_bytes().to_vec())
}

fn structured_request() -> UploadRequest {
    UploadRequest::structured(
        file("budget.csv", BUDGET_CSV),
        file("change_orders.csv", CHANGE_ORDERS_CSV),
        file("vendors.csv", VENDOR_MAP_CSV),
        file("categories.csv", CATEGORY_MAP_CSV),
    )
}

fn variance_items(response: &PipelineResponse) -> &[VarianceItem] {
    match &response.result {
        PipelineResult::VarianceItems(items) => items,
        other => panic!("expected variance items, got {:?}", other),
    }
}

/// Answers every call with the same reply and counts the calls.
struct ScriptedClient {
    reply: std::result::Result<&'static str, &'static str>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    fn ok(reply: &'static str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(reply),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(message: &'static str) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(message),
            calls: AtomicUsize::new(0),
        })
    }
}

impl LlmClient for ScriptedClient {
    fn complete(&self, _request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .reply
            .map(str::to_string)
            .map_err(|m| IntakeError::LlmTransport(m.to_string()));
        async move { reply }.boxed()
    }
}

fn no_retry_config() -> PipelineConfig {
    PipelineConfig {
        llm_max_retries: 0,
        llm_timeout_secs: 5,
        ..PipelineConfig::default()
    }
}

#[tokio::test]
async fn test_structured_upload_reconciles_with_change_orders() {
    let response = Pipeline::new(PipelineConfig::default())
        .run(structured_request())
        .await
        .unwrap();
    let items = variance_items(&response);
    assert_eq!(items.len(), 2);

    for item in items {
        assert_eq!(item.variance_sar, item.actual_sar - item.budget_sar);
        assert!(!item.evidence_refs.is_empty());
    }

    let civil = items.iter().find(|i| i.category == "Civil").unwrap();
    assert_eq!(civil.budget_sar, 1_100_000.0);
    assert_eq!(civil.change_order_sar, 100_000.0);
    assert_eq!(civil.variance_sar, 50_000.0);
    assert_eq!(civil.variance_pct, Some(4.55));
    assert!(!civil.material);
    assert_eq!(civil.drivers, vec!["CO-1: Extra slab".to_string()]);
    assert_eq!(civil.vendors, vec!["Acme".to_string()]);
    assert_eq!(civil.evidence_links, vec!["https://files/co1.pdf".to_string()]);

    let mep = items.iter().find(|i| i.category == "MEP").unwrap();
    assert_eq!(mep.variance_sar, -20_000.0);
    assert!(mep.drivers.is_empty());

    let insights = response.variance_insights.as_ref().unwrap();
    assert_eq!(insights.totals.variance_sar, 30_000.0);
    assert!(response.routing.is_none());
}

#[tokio::test]
async fn test_missing_structured_file_names_the_role() {
    let request = UploadRequest {
        change_orders: None,
        ..structured_request()
    };
    let failure = Pipeline::new(PipelineConfig::default())
        .run(request)
        .await
        .unwrap_err();
    assert_eq!(failure.code(), "missing_required_sheet");
    assert!(failure.to_string().contains("change_orders"));
}

#[tokio::test]
async fn test_structured_file_without_expected_header_is_missing() {
    let request = UploadRequest {
        vendor_map: Some(file("vendors.csv", "just,some,words\n1,2,3\n")),
        ..structured_request()
    };
    let failure = Pipeline::new(PipelineConfig::default())
        .run(request)
        .await
        .unwrap_err();
    assert_eq!(failure.code(), "missing_required_sheet");
    assert!(failure.to_string().contains("vendor_map"));
}

#[tokio::test]
async fn test_mixed_tracks_rejected() {
    let request = UploadRequest {
        file: Some(file("memo.txt", MEMO)),
        ..structured_request()
    };
    let failure = Pipeline::new(PipelineConfig::default())
        .run(request)
        .await
        .unwrap_err();
    assert_eq!(failure.code(), "mixed_tracks");
}

fn budget_results(csv: &str, name: &str) -> Vec<ExtractionResult> {
    let outcome = read(name, csv.as_bytes(), None, Duration::from_secs(5)).unwrap();
    outcome
        .sheets
        .iter()
        .map(|s| extract_as(s, SheetKind::BudgetActual, &PipelineConfig::default()))
        .collect()
}

#[test]
fn test_duplicate_keys_sum_across_sheets() {
    let mut results = budget_results(
        "Project,Period,Category,Budget,Actual\nTower A,2024-03,Civil,100,120\n",
        "march_a.csv",
    );
    results.extend(budget_results(
        "Project,Period,Category,Budget,Actual\nTower A,2024-03,Civil,50,60\n",
        "march_b.csv",
    ));

    let reconciled = reconcile(&results, &[], &[], &[], &PipelineConfig::default());
    let ReconcileOutcome::Variance(report) = reconciled.outcome else {
        panic!("expected a variance report");
    };
    assert_eq!(report.items.len(), 1);
    assert_eq!(report.items[0].budget_sar, 150.0);
    assert_eq!(report.items[0].actual_sar, 180.0);
    assert_eq!(report.items[0].variance_sar, 30.0);
}

const LEDGER_ROWS: [&str; 6] = [
    "Tower A,2024-03,Civil,CC-100,1000000.01,999999.99",
    "Tower A,2024-03,Civil,CC-100,0.1,0.2",
    "Tower A,2024-03,MEP,CC-200,333.33,300",
    "Tower B,2024-04,Civil,CC-100,10,5",
    "Tower A,2024-03,MEP,CC-200,0.07,0.05",
    "Tower A,2024-03,Civil,CC-100,250.5,260.75",
];

/// Splits `order` into files of `per_file` rows each.
fn ledger_results(order: &[usize], per_file: usize) -> Vec<ExtractionResult> {
    order
        .chunks(per_file)
        .enumerate()
        .flat_map(|(n, chunk)| {
            let body: String = chunk.iter().map(|i| format!("{}\n", LEDGER_ROWS[*i])).collect();
            budget_results(
                &format!("Project,Period,Category,Cost Code,Budget,Actual\n{}", body),
                &format!("ledger_{}.csv", n),
            )
        })
        .collect()
}

type Amounts = (VarianceKey, f64, f64, f64, Option<f64>, bool);

/// Reconciled amounts per key; evidence differs with the file split and is left out.
fn reconciled_amounts(results: &[ExtractionResult]) -> Vec<Amounts> {
    let reconciled = reconcile(results, &[], &[], &[], &PipelineConfig::default());
    let ReconcileOutcome::Variance(report) = reconciled.outcome else {
        panic!("expected a variance report");
    };
    report
        .items
        .iter()
        .map(|i| (i.key(), i.budget_sar, i.actual_sar, i.variance_sar, i.variance_pct, i.material))
        .collect()
}

#[test]
fn test_reconcile_is_order_independent() {
    let baseline = reconciled_amounts(&ledger_results(&[0, 1, 2, 3, 4, 5], 6));
    assert_eq!(baseline.len(), 3);

    for (order, per_file) in [
        (vec![4, 0, 5, 2, 3, 1], 2),
        (vec![3, 5, 1, 4, 2, 0], 3),
        (vec![2, 4, 1, 0, 5, 3], 1),
    ] {
        let mut results = ledger_results(&order, per_file);
        assert_eq!(baseline, reconciled_amounts(&results), "order {:?}", order);

        results.rotate_left(1);
        assert_eq!(baseline, reconciled_amounts(&results), "rotated {:?}", order);
    }
}

#[test]
fn test_zero_budget_serialises_null_percentage() {
    let results = budget_results(
        "Project,Period,Category,Budget,Actual\nTower A,2024-03,Fitout,0,50\n",
        "fitout.csv",
    );
    let reconciled = reconcile(&results, &[], &[], &[], &PipelineConfig::default());
    let ReconcileOutcome::Variance(report) = reconciled.outcome else {
        panic!("expected a variance report");
    };
    let item = &report.items[0];
    assert_eq!(item.variance_pct, None);
    assert_eq!(item.variance_sar, 50.0);

    let json = serde_json::to_value(item).unwrap();
    assert!(json["variance_pct"].is_null());
}

#[tokio::test]
async fn test_workbook_quotes_produce_spread() -> anyhow::Result<()> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Quotes")?;
    for (col, header) in ["Item Code", "Description", "Vendor", "Qty", "Unit Price", "Total Price"]
        .iter()
        .enumerate()
    {
        sheet.write_string(0, col as u16, *header)?;
    }
    for (row, (vendor, price)) in [("Acme", 100.0), ("Bolt", 150.0)].iter().enumerate() {
        let row = row as u32 + 1;
        sheet.write_string(row, 0, "D-01")?;
        sheet.write_string(row, 1, "Fire door")?;
        sheet.write_string(row, 2, *vendor)?;
        sheet.write_number(row, 3, 10.0)?;
        sheet.write_number(row, 4, *price)?;
        sheet.write_number(row, 5, price * 10.0)?;
    }
    let bytes = workbook.save_to_buffer()?;

    let response = Pipeline::new(PipelineConfig::default())
        .run(UploadRequest::freeform(UploadedFile::new("quotes.xlsx", bytes)))
        .await
        .map_err(|f| anyhow::anyhow!(f.to_string()))?;

    let PipelineResult::ProcurementSummary(summary) = &response.result else {
        panic!("expected procurement summary, got {:?}", response.result);
    };
    assert_eq!(summary.items.len(), 2);
    let spread = &summary.insights.spreads[0];
    assert_eq!(spread.min_vendor, "Acme");
    assert_eq!(spread.max_vendor, "Bolt");
    assert_eq!(spread.spread_pct, 50.0);
    assert_eq!(spread.total_spread_sar, Some(500.0));
    assert_eq!(summary.insights.totals_per_vendor[0].vendor, "Bolt");
    Ok(())
}

#[tokio::test]
async fn test_freeform_without_header_or_llm_returns_insights() {
    let response = Pipeline::new(PipelineConfig::default())
        .run(UploadRequest::freeform(file(
            "notes.txt",
            "site visit notes\nweather was fine\n",
        )))
        .await
        .unwrap();

    assert!(matches!(response.result, PipelineResult::Insights(_)));
    assert_eq!(
        response.routing.map(|r| r.reason),
        Some(RoutingReason::NoKeyFallback)
    );
    let json = serde_json::to_value(&response).unwrap();
    assert!(json["insights"]["highlights"].is_array());
    assert!(json["diagnostics"]["correlation_id"].is_string());
}

#[tokio::test]
async fn test_forced_llm_without_key_is_configuration_error() {
    let config = PipelineConfig {
        force_llm: true,
        ..PipelineConfig::default()
    };
    let failure = Pipeline::new(config)
        .run(UploadRequest::freeform(file("memo.txt", MEMO)))
        .await
        .unwrap_err();
    assert_eq!(failure.code(), "configuration_error");
}

#[tokio::test]
async fn test_assisted_extraction_is_grounded() {
    let client = ScriptedClient::ok(
        r#"{"kind": "budget_actual", "items": [
            {"row": 2, "project": "Tower A", "period": "2024-03", "category": "Facade",
             "budget_sar": "500,000", "actual_sar": 620000},
            {"row": 2, "project": "Tower A", "period": "2024-03", "category": "Roofing",
             "budget_sar": 75000, "actual_sar": 80000}
        ]}"#,
    );
    let pipeline = Pipeline::new(no_retry_config()).with_client(client.clone());
    let response = pipeline
        .run(UploadRequest::freeform(file("memo.txt", MEMO)))
        .await
        .unwrap();

    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        response.routing.map(|r| r.reason),
        Some(RoutingReason::KeyPresent)
    );
    let items = variance_items(&response);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].category, "Facade");
    assert_eq!(items[0].variance_sar, 120_000.0);
    assert!(items[0].material);
    assert!(response
        .diagnostics
        .warnings
        .iter()
        .any(|w| w.code == WarningCode::UngroundedValueDiscarded));
}

#[tokio::test]
async fn test_assisted_values_from_dates_or_other_rows_are_discarded() {
    let client = ScriptedClient::ok(
        r#"{"kind": "budget_actual", "items": [
            {"row": 2, "category": "Concrete works", "budget_sar": 12, "actual_sar": 2024},
            {"category": "Concrete works", "budget_sar": 3, "actual_sar": 2024}
        ]}"#,
    );
    let response = Pipeline::new(no_retry_config())
        .with_client(client.clone())
        .run(UploadRequest::freeform(file(
            "site_memo.txt",
            "Issued 12/03/2024 by site office\nConcrete works\n",
        )))
        .await
        .unwrap();

    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    assert!(matches!(response.result, PipelineResult::Insights(_)));
    let dropped = response
        .diagnostics
        .warnings
        .iter()
        .filter(|w| w.code == WarningCode::MissingEvidence)
        .count();
    assert_eq!(dropped, 2);
}

#[tokio::test]
async fn test_local_only_body_flag_skips_llm() {
    let client = ScriptedClient::ok(r#"{"kind": "unrecognized", "items": []}"#);
    let request = UploadRequest {
        local_only: true,
        ..UploadRequest::freeform(file("memo.txt", MEMO))
    };
    let response = Pipeline::new(no_retry_config())
        .with_client(client.clone())
        .run(request)
        .await
        .unwrap();
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        response.routing.map(|r| r.reason),
        Some(RoutingReason::LocalOnly)
    );
}

#[tokio::test]
async fn test_llm_failure_falls_back_on_error_policy() {
    let client = ScriptedClient::failing("connection reset");
    let response = Pipeline::new(no_retry_config())
        .with_client(client)
        .run(UploadRequest::freeform(file("memo.txt", MEMO)))
        .await
        .unwrap();

    assert!(matches!(response.result, PipelineResult::Insights(_)));
    assert_eq!(
        response.routing.map(|r| r.reason),
        Some(RoutingReason::ErrorFallback)
    );
    assert!(response
        .diagnostics
        .warnings
        .iter()
        .any(|w| w.code == WarningCode::LlmFallback));
}

#[tokio::test]
async fn test_llm_failure_surfaces_under_never_policy() {
    let config = PipelineConfig {
        fallback_policy: FallbackPolicy::Never,
        ..no_retry_config()
    };
    let failure = Pipeline::new(config)
        .with_client(ScriptedClient::failing("connection reset"))
        .run(UploadRequest::freeform(file("memo.txt", MEMO)))
        .await
        .unwrap_err();
    assert_eq!(failure.code(), "llm_transport_error");
    assert!(!failure.diagnostics.events.is_empty());
}

fn inputs(force_llm: bool, local_only: bool, has_api_key: bool, policy: FallbackPolicy) -> RoutingInputs {
    RoutingInputs {
        track: Track::Freeform,
        local_only,
        force_llm,
        has_api_key,
        policy,
    }
}

#[test]
fn test_routing_table() {
    use FallbackPolicy::*;

    // force_llm, any local_only / policy
    let d = decide(&inputs(true, true, true, IfNoKey)).unwrap();
    assert_eq!((d.use_llm, d.reason), (true, RoutingReason::Forced));

    // local_only body flag
    let d = decide(&inputs(false, true, true, Never)).unwrap();
    assert_eq!((d.use_llm, d.reason), (false, RoutingReason::LocalOnly));

    // no key, if_no_key
    let d = decide(&inputs(false, false, false, IfNoKey)).unwrap();
    assert_eq!((d.use_llm, d.reason), (false, RoutingReason::NoKeyFallback));

    // no key, never
    let err = decide(&inputs(false, false, false, Never)).unwrap_err();
    assert_eq!(err.code(), "configuration_error");

    // key present
    let d = decide(&inputs(false, false, true, OnError)).unwrap();
    assert_eq!((d.use_llm, d.reason), (true, RoutingReason::KeyPresent));

    // key present, call fails, on_error
    let fallback =
        after_llm_failure(&d, OnError, IntakeError::LlmTransport("reset".into())).unwrap();
    assert_eq!(
        (fallback.use_llm, fallback.reason),
        (false, RoutingReason::ErrorFallback)
    );

    // key present, call fails, never
    let d = decide(&inputs(false, false, true, Never)).unwrap();
    let err = after_llm_failure(&d, Never, IntakeError::LlmTimeout(30)).unwrap_err();
    assert_eq!(err.code(), "llm_timeout");
}

#[test]
fn test_local_only_header_is_ignored() {
    let config = PipelineConfig {
        api_key: Some("sk-test".to_string()),
        ..PipelineConfig::default()
    };
    let request = UploadRequest {
        local_only: false,
        headers: BTreeMap::from([("x-local-only".to_string(), "true".to_string())]),
        ..UploadRequest::freeform(file("memo.txt", MEMO))
    };
    let with_header = RoutingInputs::from_request(Track::Freeform, &request, &config);
    let without_header = RoutingInputs::from_request(
        Track::Freeform,
        &UploadRequest {
            headers: BTreeMap::new(),
            ..request.clone()
        },
        &config,
    );

    assert_eq!(with_header, without_header);
    let d = decide(&with_header).unwrap();
    assert_eq!((d.use_llm, d.reason), (true, RoutingReason::KeyPresent));
}

#[tokio::test]
async fn test_job_store_runs_pipeline() {
    let store = JobStore::new(Arc::new(Pipeline::new(PipelineConfig::default())));
    let id = store.submit(structured_request());

    let mut status = store.status(id).unwrap();
    for _ in 0..200 {
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = store.status(id).unwrap();
    }
    assert_eq!(status.status, JobState::Done);
    let payload = status.payload.unwrap();
    assert_eq!(variance_items(&payload).len(), 2);
}

#[tokio::test]
async fn test_drafts_for_material_lines() {
    let config = PipelineConfig {
        materiality_amount_sar: 10_000.0,
        ..PipelineConfig::default()
    };
    let response = Pipeline::new(config)
        .run(structured_request())
        .await
        .unwrap();
    let drafts = drafts::draft_material(&LocalDraftComposer::new(true), variance_items(&response)).await;

    assert_eq!(drafts.len(), 2);
    let civil = drafts.iter().find(|d| d.key.category == "Civil").unwrap();
    assert!(civil.draft_en.starts_with("4.55% (SAR 50,000) variance in Civil."));
    assert!(civil.draft_en.contains("Drivers: CO-1: Extra slab."));
    assert!(civil.draft_en.contains("Vendors: Acme."));
    let mep = drafts.iter().find(|d| d.key.category == "MEP").unwrap();
    assert!(mep.draft_en.contains(drafts::CAUSE_PENDING_EN));
    assert!(mep.draft_ar.as_deref().unwrap().contains(drafts::CAUSE_PENDING_AR));
}

#[tokio::test]
async fn test_llm_drafts_keep_pending_line_without_drivers() {
    let config = PipelineConfig {
        materiality_amount_sar: 10_000.0,
        ..no_retry_config()
    };
    let response = Pipeline::new(config.clone())
        .run(structured_request())
        .await
        .unwrap();
    let client = ScriptedClient::ok("Overrun driven by steel price escalation.\n\nتجاوز بسبب ارتفاع أسعار الحديد.");
    let composer = LlmDraftComposer::new(client.clone(), config);
    let drafts = drafts::draft_material(&composer, variance_items(&response)).await;

    assert_eq!(drafts.len(), 2);
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);

    let civil = drafts.iter().find(|d| d.key.category == "Civil").unwrap();
    assert_eq!(civil.source, DraftSource::Llm);

    let mep = drafts.iter().find(|d| d.key.category == "MEP").unwrap();
    assert_eq!(mep.source, DraftSource::Local);
    assert!(mep.draft_en.contains(drafts::CAUSE_PENDING_EN));
    assert!(!mep.draft_en.contains("steel"));
    assert!(mep.draft_ar.as_deref().unwrap().contains(drafts::CAUSE_PENDING_AR));
}
