use criterion::{black_box, criterion_group, criterion_main, Criterion};
use msreorder::{
    ndarray::Array2, new_reader, BaselineReader, MemTable, ReadMode, ReaderOptions,
    ReaderOptionsBuilder,
};
use tempfile::tempdir;

const NUM_ANTENNAS: usize = 16;
const NUM_CHANNELS: usize = 32;
const NUM_POLS: usize = 4;
const NUM_TIMESTEPS: usize = 20;

fn synthetic_table() -> MemTable {
    MemTable::synthetic(
        "bench.ms",
        NUM_ANTENNAS,
        NUM_CHANNELS,
        NUM_POLS,
        NUM_TIMESTEPS,
    )
}

fn options(mode: ReadMode, temp_dir: &std::path::Path) -> ReaderOptions {
    ReaderOptionsBuilder::default()
        .mode(mode)
        .temp_dir(temp_dir)
        .build()
        .unwrap()
}

/// Read every baseline, in batches of the reader's recommended size.
fn read_all(reader: &mut dyn BaselineReader) -> usize {
    let keys: Vec<_> = reader
        .metadata()
        .unwrap()
        .sequences()
        .iter()
        .map(|s| s.key)
        .collect();
    let batch_size = reader.max_recommended_buffer_size(1).max(1);
    let mut flagged = 0;
    for batch in keys.chunks(batch_size) {
        for key in batch {
            reader
                .add_read_request(key.antenna1, key.antenna2, key.band, key.sequence_id)
                .unwrap();
        }
        reader.perform_read_requests().unwrap();
        for _ in batch {
            let result = reader.next_result().unwrap();
            flagged += result.flags[0].iter().filter(|&&f| f).count();
        }
    }
    flagged
}

fn bench_read_all_baselines(crt: &mut Criterion) {
    let tmp_dir = tempdir().unwrap();
    for mode in [ReadMode::Direct, ReadMode::Memory, ReadMode::Reordering] {
        crt.bench_function(&format!("read all baselines - {}", mode), |bch| {
            bch.iter(|| {
                let mut reader = new_reader(synthetic_table(), options(mode, tmp_dir.path())).unwrap();
                black_box(read_all(reader.as_mut()));
                reader.close().unwrap();
            })
        });
    }
}

fn bench_flag_all_baselines(crt: &mut Criterion) {
    let tmp_dir = tempdir().unwrap();
    for mode in [ReadMode::Direct, ReadMode::Memory, ReadMode::Reordering] {
        crt.bench_function(&format!("flag all baselines - {}", mode), |bch| {
            bch.iter(|| {
                let table = synthetic_table();
                let mut reader = new_reader(table, options(mode, tmp_dir.path())).unwrap();
                for antenna1 in 0..NUM_ANTENNAS {
                    for antenna2 in antenna1..NUM_ANTENNAS {
                        let mask = Array2::from_elem((NUM_TIMESTEPS, NUM_CHANNELS), true);
                        reader
                            .add_write_task(vec![mask], antenna1, antenna2, 0, 0)
                            .unwrap();
                    }
                }
                reader.perform_flag_write_requests().unwrap();
                reader.close().unwrap();
            })
        });
    }
}

criterion_group!(
    name = benches;
    config = Criterion::default().sample_size(10);
    targets =
        bench_read_all_baselines,
        bench_flag_all_baselines,
);
criterion_main!(benches);
