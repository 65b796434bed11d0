use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lightrag_server::lightrag::entity_extractor::{parse_extraction, HeuristicExtractor};
use lightrag_server::lightrag::tokenizer::count_tokens;
use lightrag_server::lightrag::Chunker;

const SAMPLE: &str = "Alice founded Acme Corporation in Berlin together with Bob. \
    The company builds retrieval pipelines that merge entities into a knowledge graph. ";

fn chunker_benchmark(c: &mut Criterion) {
    let chunker = Chunker::new(1200, 100);
    let text = SAMPLE.repeat(400);

    c.bench_function("chunker_split_long_text", |b| {
        b.iter(|| {
            let chunks = chunker.chunk(black_box(text.as_str()), "doc-bench", "bench.txt");
            black_box(chunks.len());
        });
    });
}

fn tokenizer_benchmark(c: &mut Criterion) {
    let text = SAMPLE.repeat(64);

    c.bench_function("count_tokens_paragraphs", |b| {
        b.iter(|| black_box(count_tokens(black_box(text.as_str()))));
    });
}

fn extractor_benchmark(c: &mut Criterion) {
    let extractor = HeuristicExtractor::new();
    let chunk = Chunker::new(4096, 0)
        .chunk(&SAMPLE.repeat(32), "doc-bench", "bench.txt")
        .remove(0);

    c.bench_function("heuristic_extractor_dense_text", |b| {
        b.iter(|| {
            let extraction = extractor.extract(black_box(&chunk));
            black_box(extraction.entities.len());
        });
    });
}

fn record_parsing_benchmark(c: &mut Criterion) {
    let records: String = (0..200)
        .map(|i| {
            format!(
                "(\"entity\"<|>\"Entity{i}\"<|>\"organization\"<|>\"Description {i}\")##\
                 (\"relationship\"<|>\"Entity{i}\"<|>\"Entity{}\"<|>\"linked\"<|>\"partner, supplier\"<|>7)##",
                i + 1
            )
        })
        .collect::<String>()
        + "<|COMPLETE|>";

    c.bench_function("parse_extraction_records", |b| {
        b.iter(|| {
            let parsed = parse_extraction(black_box(records.as_str()), "chunk-bench", "bench.txt");
            black_box(parsed.relations.len());
        });
    });
}

criterion_group!(
    benches,
    chunker_benchmark,
    tokenizer_benchmark,
    extractor_benchmark,
    record_parsing_benchmark
);
criterion_main!(benches);
