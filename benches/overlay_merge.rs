//! Overlay merge benchmarks
//!
//! The in-memory merge runs on every overlay-aware read; it must stay
//! cheap for candidate sets in the hundreds.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use symdex_engine::schema::{ContextFileState, FileState, Symbol, SymbolKind};
use symdex_engine::store::merge::{merge_symbols, StateIndex};

fn symbols_for(prefix: &str, files: usize, per_file: usize) -> Vec<Symbol> {
    let mut out = Vec::with_capacity(files * per_file);
    for f in 0..files {
        for s in 0..per_file {
            out.push(Symbol {
                file_key: format!("repoA:src/{}_{}.cpp", prefix, f),
                name: format!("sym_{}", s),
                qualified_name: format!("ns::{}::sym_{}", f, s),
                kind: SymbolKind::Function,
                line: (s * 10 + 1) as u32,
                col: 1,
                extent_end_line: (s * 10 + 8) as u32,
            });
        }
    }
    out
}

fn bench_merge(c: &mut Criterion) {
    let baseline = symbols_for("base", 500, 20);
    let overlay = symbols_for("base", 50, 20);
    let states: Vec<ContextFileState> = (0..50)
        .map(|f| ContextFileState {
            file_key: format!("repoA:src/base_{}.cpp", f),
            state: FileState::Modified,
            replaced_from_file_key: None,
        })
        .collect();
    let index = StateIndex::new(&states);

    c.bench_function("merge_symbols_500_files_50_changed", |b| {
        b.iter(|| {
            merge_symbols(
                black_box(baseline.clone()),
                black_box(overlay.clone()),
                black_box(&index),
            )
        })
    });
}

fn bench_state_index(c: &mut Criterion) {
    let states: Vec<ContextFileState> = (0..5000)
        .map(|f| ContextFileState {
            file_key: format!("repoA:src/changed_{}.cpp", f),
            state: FileState::Modified,
            replaced_from_file_key: None,
        })
        .collect();

    c.bench_function("state_index_5000_files", |b| {
        b.iter(|| StateIndex::new(black_box(&states)))
    });
}

criterion_group!(benches, bench_merge, bench_state_index);
criterion_main!(benches);
