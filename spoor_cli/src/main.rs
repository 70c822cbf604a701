use spoor_core::byteset::{ByteSet, ConcurrentByteSet, LayeredByteSet};
use spoor_core::collector::{
    collect_counter_features, decode_feature_batch, domain_breakdown, encode_cmp_observation,
    encode_feature_batch, push_user_feature, UserDomainMask,
};
use spoor_core::config::SpoorConfig;
use spoor_core::dictionary::ContainerDictionary;
use spoor_core::feature::{Feature, FeatureArray};
use spoor_core::torc::TablesOfRecentCompares;

use clap::Parser;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

/// Coverage map: 4096 counter slots behind a 64-byte presence layer.
type CoverageMap = LayeredByteSet<ConcurrentByteSet<64>, ConcurrentByteSet<4096>>;

const FEATURE_CAPACITY: usize = 1024;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(short, long)]
    iterations: Option<u64>,
}

/// A hand-instrumented toy target. Each interesting branch bumps a
/// pseudo-PC counter; every comparison reports its operands to the TORCs
/// and its outcome to the compare encoders.
fn demo_harness(
    data: &[u8],
    coverage: &CoverageMap,
    torc: &mut TablesOfRecentCompares,
    features: &mut FeatureArray<FEATURE_CAPACITY>,
) {
    coverage.saturated_increment(1);

    for (offset, &byte) in data.iter().take(32).enumerate() {
        if byte == 0 {
            coverage.saturated_increment(100 + offset);
        }
    }

    if data.len() >= 4 {
        coverage.saturated_increment(2);
        let mut magic_bytes = [0u8; 4];
        magic_bytes.copy_from_slice(&data[..4]);
        let magic = u32::from_le_bytes(magic_bytes);
        let expected = u32::from_le_bytes(*b"SPOR");
        torc.integers_mut::<u32>().insert(magic, expected);
        encode_cmp_observation(0x1001, u64::from(magic), u64::from(expected), |feature| {
            features.push(feature)
        });
        if magic == expected {
            coverage.saturated_increment(3);

            if data.len() >= 12 {
                let tail = &data[4..12];
                torc.buffers_mut().insert(tail, b"trailkey");
                if tail == b"trailkey" {
                    coverage.saturated_increment(4);
                }
            }
        }
    }

    if data.len() >= 20 {
        let mut word_bytes = [0u8; 8];
        word_bytes.copy_from_slice(&data[12..20]);
        let word = u64::from_le_bytes(word_bytes);
        torc.integers_mut::<u64>().insert(word, 0x0123_4567_89AB_CDEF);
        encode_cmp_observation(0x1002, word, 0x0123_4567_89AB_CDEF, |feature| {
            features.push(feature)
        });
        if word == 0x0123_4567_89AB_CDEF {
            coverage.saturated_increment(5);
        }
    }
}

/// Flips one byte, or splices a TORC-mined hint when one is available.
fn mutate(
    base: &[u8],
    rng: &mut ChaCha8Rng,
    torc: &TablesOfRecentCompares,
) -> Vec<u8> {
    let mut input = if base.is_empty() { vec![0u8] } else { base.to_vec() };

    if rng.random_bool(0.3) {
        if let Some(hint) = ContainerDictionary::<u8>::random_torc_entry(&input, rng, torc) {
            if !hint.value.is_empty() {
                let at = hint
                    .position_hint
                    .unwrap_or_else(|| rng.random_range(0..input.len()));
                let end = (at + hint.value.len()).min(input.len());
                input[at..end].copy_from_slice(&hint.value[..end - at]);
                return input;
            }
        }
    }

    let idx = rng.random_range(0..input.len());
    input[idx] = input[idx].wrapping_add(rng.random_range(1u8..=15));
    if rng.random_bool(0.2) && input.len() < 64 {
        input.push(rng.random_range(0..=255u8));
    }
    input
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let mut config = match cli.config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            SpoorConfig::load_from_file(&config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("spoor.toml");
            if default_config_path.exists() {
                println!("No config file specified via CLI, loading default: {default_config_path:?}");
                SpoorConfig::load_from_file(&default_config_path)?
            } else {
                SpoorConfig::default()
            }
        }
    };

    if let Some(iterations) = cli.iterations {
        config
            .engine
            .get_or_insert_with(Default::default)
            .max_iterations = iterations;
    }

    let engine = config.engine.unwrap_or_default();
    let feature_settings = config.features.unwrap_or_default();
    let mask = UserDomainMask(feature_settings.user_domain_mask);

    let mut seed = [0u8; 32];
    seed[..8].copy_from_slice(&engine.rng_seed.to_le_bytes());
    let mut rng = ChaCha8Rng::from_seed(seed);

    let mut coverage: CoverageMap = LayeredByteSet::new(ConcurrentByteSet::new(), ConcurrentByteSet::new());
    let mut torc = TablesOfRecentCompares::new();
    let mut features = FeatureArray::<FEATURE_CAPACITY>::new();

    let mut corpus: Vec<Vec<u8>> = vec![b"GOOD".to_vec()];
    let mut known_input_hashes: HashSet<[u8; 16]> = corpus
        .iter()
        .map(|input| md5::compute(input).0)
        .collect();
    let mut seen_features: HashSet<Feature> = HashSet::new();

    println!(
        "Starting demo loop for {} iterations with user domain mask {:#x}...",
        engine.max_iterations, mask.0
    );
    let start_time = Instant::now();
    let mut executions = 0u64;
    let mut batches_shipped = 0u64;

    for i in 0..engine.max_iterations {
        let base_idx = rng.random_range(0..corpus.len());
        let input = mutate(&corpus[base_idx], &mut rng, &torc);
        executions += 1;

        features.clear();
        demo_harness(&input, &coverage, &mut torc, &mut features);
        collect_counter_features(&mut coverage, &mut features);
        if input.len() > 16 {
            push_user_feature(mask, 0, input.len() as u64, &mut features);
        }

        // Ship the batch through the wire format, as a runner would.
        let batch = &features.as_slice()
            [..features.len().min(feature_settings.max_features_per_batch)];
        let encoded = encode_feature_batch(batch)?;
        let received = decode_feature_batch(&encoded)?;
        batches_shipped += 1;

        let mut new_features = 0usize;
        for &feature in received.iter().filter(|&&f| mask.admits(f)) {
            if seen_features.insert(feature) {
                new_features += 1;
            }
        }

        if new_features > 0 {
            let input_hash = md5::compute(&input).0;
            if known_input_hashes.insert(input_hash) {
                corpus.push(input);
            }
        }

        if i > 0 && i % (engine.max_iterations / 100).max(1) == 0 {
            let elapsed = start_time.elapsed().as_secs_f32();
            let exec_per_sec = if elapsed > 0.0 {
                executions as f32 / elapsed
            } else {
                0.0
            };
            print!(
                "\rIter: {}/{}, Corpus: {}, Features: {}, Execs/sec: {:.2}   ",
                i,
                engine.max_iterations,
                corpus.len(),
                seen_features.len(),
                exec_per_sec
            );
            use std::io::Write;
            std::io::stdout().flush()?;
        }
    }

    let elapsed_total = start_time.elapsed();
    println!("\nDemo loop finished in {elapsed_total:.2?}.");
    println!(
        "Total Executions: {}, Batches Shipped: {}, Corpus Size: {}, Distinct Features: {}",
        executions,
        batches_shipped,
        corpus.len(),
        seen_features.len()
    );

    let all_features: Vec<Feature> = seen_features.into_iter().collect();
    let breakdown = domain_breakdown(&all_features);
    println!(
        "Feature counts by domain: {}",
        serde_json::to_string_pretty(&breakdown)?
    );

    Ok(())
}
