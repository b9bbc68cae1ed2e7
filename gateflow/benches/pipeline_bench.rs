//! Benchmarks for gates, backoff and output classification.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gateflow::gates::{Gate, ProcessGate, SynthesisGate};
use gateflow::gateway::{BackoffStrategy, JitterStrategy, RetryConfig, RetryState};
use gateflow::state::{ProcessResult, StageOutput, SynthesisResult, TextFormat};

fn gate_benchmark(c: &mut Criterion) {
    let gate = ProcessGate::new(0.5);
    let output = StageOutput::Process(ProcessResult {
        content: "Plants convert light into chemical energy.".to_string(),
        confidence: 0.72,
        metadata: serde_json::Map::new(),
    });
    c.bench_function("process_gate", |b| b.iter(|| gate.evaluate(black_box(&output))));

    let synthesis = StageOutput::Synthesis(SynthesisResult::new("# Answer\n- one\n- two"));
    c.bench_function("synthesis_gate", |b| {
        b.iter(|| SynthesisGate.evaluate(black_box(&synthesis)))
    });
}

fn backoff_benchmark(c: &mut Criterion) {
    let config = RetryConfig::new()
        .with_max_attempts(10)
        .with_backoff(BackoffStrategy::Exponential)
        .with_jitter(JitterStrategy::Decorrelated);
    c.bench_function("calculate_delay", |b| {
        b.iter(|| {
            let mut state = RetryState::new();
            for _ in 0..5 {
                state.begin_attempt();
                black_box(state.calculate_delay(&config));
            }
        })
    });
}

fn classify_benchmark(c: &mut Criterion) {
    let text = "Photosynthesis happens in two stages.\n\n1. Light reactions\n2. Calvin cycle\n";
    c.bench_function("classify_text", |b| b.iter(|| TextFormat::classify(black_box(text))));
}

criterion_group!(benches, gate_benchmark, backoff_benchmark, classify_benchmark);
criterion_main!(benches);
