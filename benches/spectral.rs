//! Benchmarks for window reading and spectral target computation.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::f32::consts::PI;
use std::path::Path;

// Import from our crate (lib name is "_rs" per Cargo.toml)
use _rs::spectral::{CqtTransform, SpectralConfig, SpectralFeatures};
use _rs::window::WindowReader;

/// Synthetic 440 Hz tone, 5 seconds at 16kHz.
fn make_waveform() -> Vec<f32> {
    let sample_rate = 16000;
    let n_samples = sample_rate * 5;
    (0..n_samples)
        .map(|i| (2.0 * PI * 440.0 * i as f32 / sample_rate as f32).sin())
        .collect()
}

/// 30 s stereo WAV at 44.1kHz, so reads exercise seeking and resampling.
fn write_wav(path: &Path) {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 44100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
    for i in 0..44100 * 30 {
        let x = ((2.0 * PI * 220.0 * i as f32 / 44100.0).sin() * 8000.0) as i16;
        writer.write_sample(x).expect("write sample");
        writer.write_sample(x / 2).expect("write sample");
    }
    writer.finalize().expect("finalize wav");
}

fn bench_spectral(c: &mut Criterion) {
    let waveform = make_waveform();
    let cqt = CqtTransform::new(SpectralConfig::with_bins(16000, 84));

    c.bench_function("cqt_5s_16k", |b| b.iter(|| cqt.transform(black_box(&waveform))));

    let batch = ndarray::Array2::from_shape_fn((8, waveform.len()), |(_, j)| waveform[j]);
    c.bench_function("cqt_batch_8x5s", |b| b.iter(|| cqt.compute(black_box(batch.view()))));
}

fn bench_window(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("long.wav");
    write_wav(&path);

    let reader = WindowReader::new(80000, 16000);
    let mut rng = StdRng::seed_from_u64(0);
    c.bench_function("window_5s_from_30s_44k_stereo", |b| {
        b.iter(|| {
            reader
                .read(black_box(&path), 30.0, 44100, true, &mut rng)
                .expect("read window")
        })
    });
}

criterion_group!(benches, bench_spectral, bench_window);
criterion_main!(benches);
