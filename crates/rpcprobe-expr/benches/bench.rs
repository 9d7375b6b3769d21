use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use rpcprobe_expr::{Exchange, MapContext, evaluate, parse, tokenize};

const EXTRACT: &str = "$env.token = $res.$body.$json.data.session.accessToken";
const CONTAIN: &str = r#"@contain($res.$body.$str, "accessToken")"#;

fn response_body() -> String {
    let padding: String = (0..64).map(|i| format!(r#""k{i}":{i},"#)).collect();
    format!(r#"{{{padding}"data":{{"session":{{"accessToken":"abc.def.ghi"}}}}}}"#)
}

fn benchmark_front_end(c: &mut Criterion) {
    let mut group = c.benchmark_group("front_end");
    group.throughput(Throughput::Bytes(EXTRACT.len() as u64));

    group.bench_function("tokenize", |b| {
        b.iter(|| black_box(tokenize(black_box(EXTRACT))));
    });
    group.bench_function("parse", |b| {
        b.iter(|| black_box(parse(black_box(EXTRACT))));
    });

    group.finish();
}

fn benchmark_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");
    let mut ctx = MapContext::default().with_response(Exchange::new(response_body()));

    group.bench_function("extract_json", |b| {
        b.iter(|| black_box(evaluate(black_box(EXTRACT), &mut ctx)));
    });
    group.bench_function("contain_str", |b| {
        b.iter(|| black_box(evaluate(black_box(CONTAIN), &mut ctx)));
    });

    group.finish();
}

criterion_group!(benches, benchmark_front_end, benchmark_evaluate);
criterion_main!(benches);
