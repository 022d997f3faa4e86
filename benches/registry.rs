// this_file: benches/registry.rs
//! Benchmarks for basename derivation, cache building and registry lookups

use camino::Utf8Path;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fcdircache::{basename, CacheConfig, FileStat, FontDirCache, FontSet, Pattern, Registry};

fn font_set(n: usize) -> FontSet {
    (0..n)
        .map(|i| {
            Pattern::new()
                .with("family", format!("Bench {}", i % 8))
                .with("file", format!("/fonts/bench/{}.ttf", i))
                .with("weight", (i % 9) as i32 * 100)
        })
        .collect()
}

fn bench_basename(c: &mut Criterion) {
    let config = CacheConfig::new().with_cache_dir("/var/cache/fcdircache");
    c.bench_function("basename", |b| {
        b.iter(|| basename(black_box(&config), black_box(Utf8Path::new("/usr/share/fonts/truetype"))));
    });
}

fn bench_build(c: &mut Criterion) {
    let fdc = FontDirCache::with_registry(CacheConfig::new(), Registry::new());
    let stat = FileStat::default();
    let mut group = c.benchmark_group("dir_build");
    for n in [1, 64, 1024] {
        let set = font_set(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &set, |b, set| {
            b.iter(|| fdc.dir_build(black_box(set), "/fonts/bench", &stat, &[]).unwrap());
        });
    }
    group.finish();
}

fn bench_find_by_addr(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_by_addr");
    for live in [1usize, 16, 256] {
        let fdc = FontDirCache::with_registry(CacheConfig::new(), Registry::new());
        let caches: Vec<_> = (0..live)
            .map(|i| {
                fdc.dir_build(&font_set(1 + i % 4), "/fonts/bench", &FileStat::default(), &[])
                    .unwrap()
            })
            .collect();
        let probes: Vec<usize> = caches.iter().map(|c| c.base() + c.size() / 2).collect();
        group.bench_with_input(BenchmarkId::from_parameter(live), &probes, |b, probes| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % probes.len();
                black_box(fdc.registry().find_by_addr(probes[i]))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_basename, bench_build, bench_find_by_addr);
criterion_main!(benches);
