//! Integration tests for symdex-engine
//!
//! These tests verify end-to-end behavior across modules: overlay
//! precedence, composite-hash freshness, single-writer safety, parse
//! budgets, sparse-overlay caps, and the sync job queue. The native
//! extractor is stubbed with a script that replays JSON fixtures (see
//! `common`), so no compiler toolchain is required.

mod common;

use std::process::Command;

use common::{facts_json, make_file_facts, TestWorkspace};
use symdex_engine::api::{
    ChangedFileParam, CreateOverlayRequest, FileSymbolsRequest, SymbolQueryRequest,
};
use symdex_engine::schema::{
    ContextFileState, ContextStatus, FileState, Freshness, JobQueue, JobStatus, OverlayMode,
    SyncJob,
};
use symdex_engine::store::writer::{WriteOp, WriteOutcome};
use symdex_engine::{EngineConfig, EngineError};

fn baseline_id() -> String {
    "baseline:ws1".to_string()
}

// ============================================================================
// Overlay precedence (P2)
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlay_precedence_masks_and_overrides() {
    let ws = TestWorkspace::new();
    let engine = ws.engine().await;

    // Baseline facts for three files
    for rel in ["src/kept.cpp", "src/changed.cpp", "src/gone.cpp"] {
        let facts = make_file_facts(
            &baseline_id(),
            "repoA",
            rel,
            &[("base_sym", &format!("ns::base_{}", rel.len()), 3, 9)],
            &[],
        );
        engine
            .writer
            .submit(WriteOp::UpsertFileFacts(Box::new(facts)))
            .await
            .unwrap();
    }

    // Overlay: changed.cpp modified, gone.cpp deleted, kept.cpp untouched
    let overlay = engine
        .contexts
        .create_pr_overlay(
            "ws1",
            vec![
                ContextFileState {
                    file_key: "repoA:src/changed.cpp".into(),
                    state: FileState::Modified,
                    replaced_from_file_key: None,
                },
                ContextFileState {
                    file_key: "repoA:src/gone.cpp".into(),
                    state: FileState::Deleted,
                    replaced_from_file_key: None,
                },
            ],
        )
        .await
        .unwrap();

    let overlay_facts = make_file_facts(
        &overlay.context_id,
        "repoA",
        "src/changed.cpp",
        &[("new_sym", "ns::new_sym", 5, 12)],
        &[],
    );
    engine
        .writer
        .submit(WriteOp::UpsertFileFacts(Box::new(overlay_facts)))
        .await
        .unwrap();

    let chain = engine.store.context_chain(&overlay.context_id).unwrap();

    // Deleted file: tombstoned
    let gone = engine
        .store
        .get_file_symbols(&chain, "repoA:src/gone.cpp")
        .unwrap();
    assert!(gone.is_empty());

    // Modified file: overlay wins
    let changed = engine
        .store
        .get_file_symbols(&chain, "repoA:src/changed.cpp")
        .unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].qualified_name, "ns::new_sym");

    // Untouched file: baseline fall-through
    let kept = engine
        .store
        .get_file_symbols(&chain, "repoA:src/kept.cpp")
        .unwrap();
    assert_eq!(kept.len(), 1);
    assert!(kept[0].qualified_name.starts_with("ns::base_"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rename_masks_old_key() {
    let ws = TestWorkspace::new();
    let engine = ws.engine().await;

    let facts = make_file_facts(
        &baseline_id(),
        "repoA",
        "src/old_name.cpp",
        &[("widget", "ns::widget", 1, 20)],
        &[],
    );
    engine
        .writer
        .submit(WriteOp::UpsertFileFacts(Box::new(facts)))
        .await
        .unwrap();

    let overlay = engine
        .contexts
        .create_pr_overlay(
            "ws1",
            vec![ContextFileState {
                file_key: "repoA:src/new_name.cpp".into(),
                state: FileState::Renamed,
                replaced_from_file_key: Some("repoA:src/old_name.cpp".into()),
            }],
        )
        .await
        .unwrap();

    let chain = engine.store.context_chain(&overlay.context_id).unwrap();
    let old = engine
        .store
        .get_file_symbols(&chain, "repoA:src/old_name.cpp")
        .unwrap();
    assert!(old.is_empty(), "renamed-from key must be suppressed");
}

// ============================================================================
// Freshness & include remap (P1, P3, P4)
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn header_change_triggers_staleness_of_includer() {
    let ws = TestWorkspace::new();
    let header = ws.add_file("repoB", "include/u.h", "#pragma once\nint util();\n");
    let x_cpp = ws.add_file(
        "repoA",
        "src/x.cpp",
        "#include \"u.h\"\nint use() { return util(); }\n",
    );
    ws.write_compile_db("repoA", &["src/x.cpp"]);
    ws.write_facts_fixture(
        "repoA",
        "src/x.cpp",
        facts_json(
            &x_cpp,
            &[("use", "use", "Function", 2, 2)],
            &[("util", 2, 21, "call")],
            &[("use", "util", 2)],
            &[&header],
        ),
    );

    let engine = ws.engine().await;

    // Parse and persist, then verify it classifies fresh
    engine
        .explore_parse_file("ws1", &None, "repoA:src/x.cpp")
        .await
        .unwrap();
    let classified = engine
        .explore_classify_freshness("ws1", &None, vec!["repoA:src/x.cpp".into()])
        .await
        .unwrap();
    assert_eq!(classified[0].1, Freshness::Fresh);

    // Touch the header in repoB: the repoA includer must go stale
    ws.add_file(
        "repoB",
        "include/u.h",
        "#pragma once\nint util();\nint util2();\n",
    );
    let classified = engine
        .explore_classify_freshness("ws1", &None, vec!["repoA:src/x.cpp".into()])
        .await
        .unwrap();
    assert_eq!(classified[0].1, Freshness::Stale);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_compile_flags_classify_as_missing_flags() {
    let ws = TestWorkspace::new();
    ws.add_file("repoA", "src/orphan.cpp", "int orphan() { return 0; }\n");
    // No compile db at all for repoA

    let engine = ws.engine().await;
    let classified = engine
        .explore_classify_freshness("ws1", &None, vec!["repoA:src/orphan.cpp".into()])
        .await
        .unwrap();
    assert_eq!(classified[0].1, Freshness::MissingFlags);
}

// ============================================================================
// Single-writer safety (P5)
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_submissions_all_settle_without_lock_errors() {
    let ws = TestWorkspace::new();
    let engine = ws.engine().await;

    let mut handles = Vec::new();
    for i in 0..50 {
        let writer = engine.writer.clone();
        handles.push(tokio::spawn(async move {
            let rel = format!("src/gen_{}.cpp", i);
            let facts = make_file_facts(
                &baseline_id(),
                "repoA",
                &rel,
                &[("f", &format!("ns::f{}", i), 1, 3)],
                &[],
            );
            writer
                .submit(WriteOp::UpsertFileFacts(Box::new(facts)))
                .await
        }));
    }

    for handle in handles {
        let outcome = handle.await.unwrap();
        match outcome {
            Ok(_) => {}
            Err(e) => panic!("writer op failed: {}", e),
        }
    }

    let chain = engine.store.context_chain(&baseline_id()).unwrap();
    let keys: Vec<String> = (0..50)
        .map(|i| format!("repoA:src/gen_{}.cpp", i))
        .collect();
    let tracked = engine.store.get_tracked_many(&chain, &keys).unwrap();
    assert_eq!(tracked.len(), 50);
}

// ============================================================================
// Parse budget (P6)
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parse_budget_bounds_fanout() {
    let ws = TestWorkspace::new();
    let mut rels = Vec::new();
    for i in 0..20 {
        let rel = format!("src/probe_{}.cpp", i);
        ws.add_file(
            "repoA",
            &rel,
            "int site() { return budget_probe(); }\n",
        );
        rels.push(rel);
    }
    let rel_refs: Vec<&str> = rels.iter().map(|s| s.as_str()).collect();
    ws.write_compile_db("repoA", &rel_refs);

    let config = EngineConfig {
        max_parse_budget: 5,
        ..ws.config()
    };
    let engine = ws.engine_with(config).await;

    let req = SymbolQueryRequest {
        workspace_id: "ws1".into(),
        symbol: "budget_probe".into(),
        analysis_context: None,
        scope: None,
        direction: None,
    };
    let outcome = engine.query_references(&req).await.unwrap();

    assert!(outcome
        .confidence
        .warnings
        .iter()
        .any(|w| w == "budget_exceeded"));
    assert_eq!(outcome.confidence.verified_files.len(), 5);
    assert_eq!(outcome.confidence.unparsed_files.len(), 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_excess_over_budget_reports_as_unparsed() {
    let ws = TestWorkspace::new();
    let mut rels = Vec::new();
    for i in 0..8 {
        let rel = format!("src/drift_{}.cpp", i);
        let abs = ws.add_file(
            "repoA",
            &rel,
            "int site() { return stale_probe(); }\n",
        );
        ws.write_facts_fixture(
            "repoA",
            &rel,
            facts_json(
                &abs,
                &[("site", &format!("site_{}", i), "Function", 1, 1)],
                &[("stale_probe", 1, 21, "call")],
                &[],
                &[],
            ),
        );
        rels.push(rel);
    }
    let rel_refs: Vec<&str> = rels.iter().map(|s| s.as_str()).collect();
    ws.write_compile_db("repoA", &rel_refs);

    // First pass: index everything within budget so all eight are cached
    let engine = ws.engine().await;
    let req = SymbolQueryRequest {
        workspace_id: "ws1".into(),
        symbol: "stale_probe".into(),
        analysis_context: None,
        scope: None,
        direction: None,
    };
    let outcome = engine.query_references(&req).await.unwrap();
    assert_eq!(outcome.confidence.verified_files.len(), 8);
    drop(engine);

    // Mutate every file so the stored composite hashes no longer match
    for (i, rel) in rels.iter().enumerate() {
        ws.add_file(
            "repoA",
            rel,
            &format!("int site() {{ return stale_probe(); }}\nint pad_{}();\n", i),
        );
    }

    // Second pass with a budget of three: five stale candidates exceed
    // the budget and must surface as unparsed, not stale
    let config = EngineConfig {
        max_parse_budget: 3,
        ..ws.config()
    };
    let engine = ws.engine_with(config).await;
    let outcome = engine.query_references(&req).await.unwrap();

    assert!(outcome
        .confidence
        .warnings
        .iter()
        .any(|w| w == "budget_exceeded"));
    assert_eq!(outcome.confidence.verified_files.len(), 3);
    assert_eq!(outcome.confidence.unparsed_files.len(), 5);
    assert!(
        outcome.confidence.stale_files.is_empty(),
        "budget-excess stale files belong in unparsed_files, got {:?}",
        outcome.confidence.stale_files
    );
}

// ============================================================================
// Sparse overlay caps (P7)
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_overlay_degrades_to_partial() {
    let ws = TestWorkspace::new();
    let config = EngineConfig {
        max_overlay_files: 3,
        ..ws.config()
    };
    let engine = ws.engine_with(config).await;

    let changed: Vec<ChangedFileParam> = (0..5)
        .map(|i| ChangedFileParam {
            file_key: format!("repoA:src/big_{}.cpp", i),
            state: FileState::Modified,
            replaced_from_file_key: None,
        })
        .collect();
    let req = CreateOverlayRequest {
        workspace_id: "ws1".into(),
        base_ref: None,
        head_ref: None,
        changed_files: Some(changed),
    };
    let overlay = engine.context_create_pr_overlay(&req).await.unwrap();
    assert_eq!(overlay.overlay_mode, OverlayMode::PartialOverlay);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn row_cap_breach_flips_mode_and_refuses_persist() {
    let ws = TestWorkspace::new();
    let config = EngineConfig {
        max_overlay_rows: 2,
        ..ws.config()
    };
    let engine = ws.engine_with(config).await;

    let overlay = engine
        .contexts
        .create_pr_overlay(
            "ws1",
            vec![ContextFileState {
                file_key: "repoA:src/fat.cpp".into(),
                state: FileState::Modified,
                replaced_from_file_key: None,
            }],
        )
        .await
        .unwrap();
    assert_eq!(overlay.overlay_mode, OverlayMode::Sparse);

    // Three fact rows against a cap of two
    let facts = make_file_facts(
        &overlay.context_id,
        "repoA",
        "src/fat.cpp",
        &[("a", "ns::a", 1, 2), ("b", "ns::b", 3, 4), ("c", "ns::c", 5, 6)],
        &[],
    );
    let err = engine
        .writer
        .submit(WriteOp::UpsertFileFacts(Box::new(facts)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OverlayCapExceeded { .. }));

    let reloaded = engine
        .store
        .get_context(&overlay.context_id)
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.overlay_mode, OverlayMode::PartialOverlay);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partial_overlay_serves_lazy_parse_from_memory() {
    let ws = TestWorkspace::new();
    let lazy_cpp = ws.add_file(
        "repoA",
        "src/lazy.cpp",
        "int lazy_symbol() { return 42; }\n",
    );
    ws.write_compile_db("repoA", &["src/lazy.cpp"]);
    ws.write_facts_fixture(
        "repoA",
        "src/lazy.cpp",
        facts_json(
            &lazy_cpp,
            &[("lazy_symbol", "lazy_symbol", "Function", 1, 1)],
            &[],
            &[],
            &[],
        ),
    );

    let engine = ws.engine().await;
    let overlay = engine
        .contexts
        .create_pr_overlay(
            "ws1",
            vec![ContextFileState {
                file_key: "repoA:src/lazy.cpp".into(),
                state: FileState::Added,
                replaced_from_file_key: None,
            }],
        )
        .await
        .unwrap();
    // Force the degraded mode directly
    engine
        .writer
        .submit(WriteOp::SetOverlayMode {
            context_id: overlay.context_id.clone(),
            mode: OverlayMode::PartialOverlay,
        })
        .await
        .unwrap();

    let req = SymbolQueryRequest {
        workspace_id: "ws1".into(),
        symbol: "lazy_symbol".into(),
        analysis_context: Some(symdex_engine::api::AnalysisContextParam {
            mode: Some("pr".into()),
            context_id: Some(overlay.context_id.clone()),
            ..Default::default()
        }),
        scope: None,
        direction: None,
    };
    let outcome = engine.query_definition(&req).await.unwrap();

    assert_eq!(outcome.confidence.overlay_mode, "partial_overlay");
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].qualified_name, "lazy_symbol");

    // Nothing was persisted into the degraded overlay
    let chain = engine.store.context_chain(&overlay.context_id).unwrap();
    let tracked = engine
        .store
        .get_tracked(&chain, "repoA:src/lazy.cpp")
        .unwrap();
    assert!(tracked.is_none());
}

// ============================================================================
// Cross-repo reference scenario
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cross_repo_reference_query() {
    let ws = TestWorkspace::new();
    let util_cpp = ws.add_file(
        "repoB",
        "src/util.cpp",
        "namespace repoB { namespace util { int foo() { return 1; } } }\n",
    );
    let x_cpp = ws.add_file(
        "repoA",
        "src/x.cpp",
        "int caller() { return repoB::util::foo(); }\n",
    );
    ws.write_compile_db("repoA", &["src/x.cpp"]);
    ws.write_compile_db("repoB", &["src/util.cpp"]);
    ws.write_facts_fixture(
        "repoA",
        "src/x.cpp",
        facts_json(
            &x_cpp,
            &[("caller", "caller", "Function", 1, 1)],
            &[("repoB::util::foo", 1, 23, "call")],
            &[("caller", "repoB::util::foo", 1)],
            &[],
        ),
    );
    ws.write_facts_fixture(
        "repoB",
        "src/util.cpp",
        facts_json(
            &util_cpp,
            &[("foo", "repoB::util::foo", "Function", 1, 1)],
            &[],
            &[],
            &[],
        ),
    );

    let engine = ws.engine().await;
    let req = SymbolQueryRequest {
        workspace_id: "ws1".into(),
        symbol: "repoB::util::foo".into(),
        analysis_context: None,
        scope: None,
        direction: None,
    };
    let outcome = engine.query_references(&req).await.unwrap();

    let hit = outcome
        .results
        .iter()
        .find(|r| r.file_key == "repoA:src/x.cpp")
        .expect("cross-repo reference present");
    assert_eq!(hit.line, 1);
    assert_eq!(hit.col, 23);
    assert_eq!(hit.ref_kind, symdex_engine::RefKind::Call);

    assert_eq!(outcome.confidence.repo_coverage.get("repoA"), Some(&1.0));
    assert_eq!(outcome.confidence.repo_coverage.get("repoB"), Some(&1.0));

    // Definition resolves into repoB
    let outcome = engine.query_definition(&req).await.unwrap();
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].file_key, "repoB:src/util.cpp");
}

// ============================================================================
// PR overlay masks deletion scenario
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pr_overlay_masks_deleted_definition() {
    let ws = TestWorkspace::new();
    ws.add_file("repoA", "src/old.cpp", "int foo() { return 0; }\n");

    let engine = ws.engine().await;
    let facts = make_file_facts(
        &baseline_id(),
        "repoA",
        "src/old.cpp",
        &[("foo", "ns::foo", 1, 1)],
        &[],
    );
    engine
        .writer
        .submit(WriteOp::UpsertFileFacts(Box::new(facts)))
        .await
        .unwrap();

    let overlay = engine
        .contexts
        .create_pr_overlay(
            "ws1",
            vec![ContextFileState {
                file_key: "repoA:src/old.cpp".into(),
                state: FileState::Deleted,
                replaced_from_file_key: None,
            }],
        )
        .await
        .unwrap();

    let req = SymbolQueryRequest {
        workspace_id: "ws1".into(),
        symbol: "ns::foo".into(),
        analysis_context: Some(symdex_engine::api::AnalysisContextParam {
            mode: Some("pr".into()),
            context_id: Some(overlay.context_id.clone()),
            ..Default::default()
        }),
        scope: None,
        direction: None,
    };
    let outcome = engine.query_definition(&req).await.unwrap();

    assert!(outcome.results.is_empty(), "deletion must mask the baseline");
    assert!(outcome
        .confidence
        .verified_files
        .iter()
        .any(|f| f == "repoA:src/old.cpp"));

    // The baseline context still answers without the overlay
    let baseline_req = SymbolQueryRequest {
        workspace_id: "ws1".into(),
        symbol: "ns::foo".into(),
        analysis_context: None,
        scope: None,
        direction: None,
    };
    let outcome = engine.query_definition(&baseline_req).await.unwrap();
    assert_eq!(outcome.results.len(), 1);
}

// ============================================================================
// File symbols
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_symbols_query_parses_on_demand() {
    let ws = TestWorkspace::new();
    let widget_cpp = ws.add_file(
        "repoA",
        "src/widget.cpp",
        "struct Widget { int size; };\nint grow(Widget&);\n",
    );
    ws.write_compile_db("repoA", &["src/widget.cpp"]);
    ws.write_facts_fixture(
        "repoA",
        "src/widget.cpp",
        facts_json(
            &widget_cpp,
            &[
                ("Widget", "Widget", "StructDecl", 1, 1),
                ("grow", "grow", "Function", 2, 2),
            ],
            &[],
            &[],
            &[],
        ),
    );

    let engine = ws.engine().await;
    let req = FileSymbolsRequest {
        workspace_id: "ws1".into(),
        file_key: "repoA:src/widget.cpp".into(),
        analysis_context: None,
    };
    let outcome = engine.query_file_symbols(&req).await.unwrap();
    assert_eq!(outcome.results.len(), 2);
    assert!(outcome
        .confidence
        .verified_files
        .contains(&"repoA:src/widget.cpp".to_string()));
}

// ============================================================================
// Sync jobs (P8, P9)
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_webhooks_collapse_to_one_job() {
    let ws = TestWorkspace::new();
    ws.write_manifest(
        r#"
workspace_id: ws1
repos:
  - repo_id: repoA
    root: repoA
    remote_url: https://gitlab.example.com/group/repoA.git
  - repo_id: repoB
    root: libs/repoB
"#,
    );
    let engine = ws.engine().await;

    let payload = serde_json::json!({
        "object_kind": "push",
        "ref": "refs/heads/main",
        "after": "a3f5c1d2e4b6a7c8d9e0f1a2b3c4d5e6f7a8b9c0",
        "project": {
            "name": "repoA",
            "path_with_namespace": "group/repoA"
        }
    });

    let first = engine.webhook_gitlab(&payload).await.unwrap();
    let second = engine.webhook_gitlab(&payload).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(first[0].id, second[0].id, "idempotency key must dedupe");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_job_dead_letters_after_max_attempts() {
    let ws = TestWorkspace::new();
    let engine = ws.engine().await;
    let now = chrono::Utc::now().to_rfc3339();

    let job = SyncJob {
        id: "job-1".into(),
        workspace_id: "ws1".into(),
        repo_id: "repoA".into(),
        ref_name: "main".into(),
        context_id: None,
        event_type: "push".into(),
        event_sha: "deadbeef".into(),
        status: JobStatus::Pending,
        attempts: 0,
        max_attempts: 3,
        lease_until: None,
        last_error: None,
        created_at: now.clone(),
        updated_at: now,
    };
    engine
        .writer
        .submit(WriteOp::InsertJob {
            queue: JobQueue::RepoSync,
            job,
        })
        .await
        .unwrap();

    for attempt in 1..=3u32 {
        // Claim
        let claimed = match engine
            .writer
            .submit(WriteOp::ClaimJob {
                queue: JobQueue::RepoSync,
                now: chrono::Utc::now().to_rfc3339(),
                lease_until: (chrono::Utc::now() + chrono::Duration::seconds(60)).to_rfc3339(),
            })
            .await
            .unwrap()
        {
            WriteOutcome::Job(Some(job)) => job,
            other => panic!("expected claimable job, got {:?}", other),
        };
        assert_eq!(claimed.status, JobStatus::Running);

        // Fail it
        let settled = match engine
            .writer
            .submit(WriteOp::FinishJob {
                queue: JobQueue::RepoSync,
                id: claimed.id.clone(),
                error: Some(format!("checkout failed #{}", attempt)),
                now: chrono::Utc::now().to_rfc3339(),
            })
            .await
            .unwrap()
        {
            WriteOutcome::Job(Some(job)) => job,
            other => panic!("expected settled job, got {:?}", other),
        };

        assert_eq!(settled.attempts, attempt);
        if attempt < 3 {
            assert_eq!(settled.status, JobStatus::Pending);
            assert!(settled.lease_until.is_none(), "lease must clear on retry");
        } else {
            assert_eq!(settled.status, JobStatus::DeadLetter);
        }
    }

    // Dead-lettered jobs are no longer claimable
    let outcome = engine
        .writer
        .submit(WriteOp::ClaimJob {
            queue: JobQueue::RepoSync,
            now: chrono::Utc::now().to_rfc3339(),
            lease_until: (chrono::Utc::now() + chrono::Duration::seconds(60)).to_rfc3339(),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, WriteOutcome::Job(None)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_lease_is_reclaimable() {
    let ws = TestWorkspace::new();
    let engine = ws.engine().await;
    let now = chrono::Utc::now().to_rfc3339();

    let job = SyncJob {
        id: "job-stale".into(),
        workspace_id: "ws1".into(),
        repo_id: "repoA".into(),
        ref_name: "main".into(),
        context_id: None,
        event_type: "push".into(),
        event_sha: "cafebabe".into(),
        status: JobStatus::Pending,
        attempts: 0,
        max_attempts: 5,
        lease_until: None,
        last_error: None,
        created_at: now.clone(),
        updated_at: now,
    };
    engine
        .writer
        .submit(WriteOp::InsertJob {
            queue: JobQueue::Index,
            job,
        })
        .await
        .unwrap();

    // First worker claims with a lease that is already in the past
    let expired_lease = (chrono::Utc::now() - chrono::Duration::seconds(30)).to_rfc3339();
    let claimed = engine
        .writer
        .submit(WriteOp::ClaimJob {
            queue: JobQueue::Index,
            now: chrono::Utc::now().to_rfc3339(),
            lease_until: expired_lease,
        })
        .await
        .unwrap();
    assert!(matches!(claimed, WriteOutcome::Job(Some(_))));

    // A second worker reclaims the same row past its lease
    let reclaimed = engine
        .writer
        .submit(WriteOp::ClaimJob {
            queue: JobQueue::Index,
            now: chrono::Utc::now().to_rfc3339(),
            lease_until: (chrono::Utc::now() + chrono::Duration::seconds(60)).to_rfc3339(),
        })
        .await
        .unwrap();
    match reclaimed {
        WriteOutcome::Job(Some(job)) => assert_eq!(job.id, "job-stale"),
        other => panic!("expected reclaim, got {:?}", other),
    }
}

// ============================================================================
// Context GC
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gc_expires_overdue_contexts_and_reclaims_rows() {
    let ws = TestWorkspace::new();
    let config = EngineConfig {
        context_ttl: std::time::Duration::from_secs(0),
        ..ws.config()
    };
    let engine = ws.engine_with(config).await;

    let overlay = engine
        .contexts
        .create_pr_overlay(
            "ws1",
            vec![ContextFileState {
                file_key: "repoA:src/tmp.cpp".into(),
                state: FileState::Added,
                replaced_from_file_key: None,
            }],
        )
        .await
        .unwrap();
    let facts = make_file_facts(
        &overlay.context_id,
        "repoA",
        "src/tmp.cpp",
        &[("tmp", "ns::tmp", 1, 2)],
        &[],
    );
    engine
        .writer
        .submit(WriteOp::UpsertFileFacts(Box::new(facts)))
        .await
        .unwrap();

    // TTL of zero means the overlay is immediately overdue
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let expired = engine.contexts.gc_sweep().await.unwrap();
    assert_eq!(expired, 1);

    let context = engine
        .store
        .get_context(&overlay.context_id)
        .unwrap()
        .unwrap();
    assert_eq!(context.status, ContextStatus::Expired);
    assert_eq!(context.overlay_file_count, 0);
}

// ============================================================================
// Repo sync end-to-end (local git fixture)
// ============================================================================

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git_in(dir: &std::path::Path, args: &[&str]) {
    let status = Command::new("git")
        .args([
            "-c",
            "user.email=test@example.com",
            "-c",
            "user.name=test",
        ])
        .args(args)
        .current_dir(dir)
        .status()
        .expect("run git");
    assert!(status.success(), "git {:?} failed", args);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_job_checks_out_exact_commit() {
    if !git_available() {
        return;
    }
    let ws = TestWorkspace::new();
    let repo_a = ws.root().join("repoA");
    git_in(&repo_a, &["init", "-q"]);
    ws.add_file("repoA", "src/main.cpp", "int main() { return 0; }\n");
    git_in(&repo_a, &["add", "."]);
    git_in(&repo_a, &["commit", "-q", "-m", "initial"]);
    let sha = String::from_utf8(
        Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&repo_a)
            .output()
            .unwrap()
            .stdout,
    )
    .unwrap()
    .trim()
    .to_string();

    let engine = ws.engine().await;
    let _workers = engine.spawn_background_tasks();

    let req = symdex_engine::api::SyncRepoRequest {
        workspace_id: "ws1".into(),
        repo_id: "repoA".into(),
        ref_name: None,
        commit_sha: Some(sha.clone()),
    };
    let job = engine.sync_repo(&req).await.unwrap();

    // Wait for the worker to settle the job
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(20);
    loop {
        let status = engine.sync_job_status(&job.id).unwrap();
        match status.status {
            JobStatus::Done => break,
            JobStatus::DeadLetter => panic!("sync dead-lettered: {:?}", status.last_error),
            _ if std::time::Instant::now() > deadline => {
                panic!("sync job did not settle: {:?}", status)
            }
            _ => tokio::time::sleep(std::time::Duration::from_millis(100)).await,
        }
    }

    // Detached HEAD at the exact commit
    let head = String::from_utf8(
        Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&repo_a)
            .output()
            .unwrap()
            .stdout,
    )
    .unwrap()
    .trim()
    .to_string();
    assert_eq!(head, sha);
}
