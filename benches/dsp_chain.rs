use criterion::{black_box, criterion_group, criterion_main, Criterion};
use relaycast::dsp::{AgcConfig, CrossfaderConfig, DspChain, DspChainConfig};

const FRAMES: usize = 1024;

fn stereo_buffer() -> Vec<f32> {
    (0..FRAMES * 2)
        .map(|i| ((i / 2) as f32 * 0.031).sin() * 0.8)
        .collect()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let input = stereo_buffer();

    c.bench_function("DspChain.process() eq", |b| {
        let mut chain = DspChain::new(DspChainConfig {
            eq_enabled: true,
            eq_preset: "broadcast".to_string(),
            ..Default::default()
        });
        let mut buffer = input.clone();
        b.iter(|| {
            buffer.copy_from_slice(&input);
            chain.process(black_box(&mut buffer), FRAMES);
        })
    });

    c.bench_function("DspChain.process() eq+agc", |b| {
        let mut chain = DspChain::new(DspChainConfig {
            eq_enabled: true,
            eq_preset: "modern_rock".to_string(),
            agc: AgcConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        });
        let mut buffer = input.clone();
        b.iter(|| {
            buffer.copy_from_slice(&input);
            chain.process(black_box(&mut buffer), FRAMES);
        })
    });

    c.bench_function("DspCrossfader.mix()", |b| {
        let mut chain = DspChain::new(DspChainConfig {
            crossfade: CrossfaderConfig {
                enabled: true,
                duration_sec: 3.0,
            },
            ..Default::default()
        });
        let incoming: Vec<f32> = input.iter().map(|s| -s).collect();
        let mut out = vec![0.0f32; FRAMES * 2];
        b.iter(|| {
            let fader = chain.crossfader_mut();
            if !fader.is_fading() {
                fader.start_fade(None);
            }
            fader.mix(black_box(&input), black_box(&incoming), &mut out, FRAMES)
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
