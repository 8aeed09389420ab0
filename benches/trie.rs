use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use state_trie::{
    LevelNodeDB, MemoryNodeDB, MerklePatriciaTrie, OpContext, Path, NODE_TYPES_ALL,
};

fn populated_trie(entries: u32) -> MerklePatriciaTrie {
    let db = LevelNodeDB::new(
        MemoryNodeDB::new(),
        Arc::new(MemoryNodeDB::new()),
        false,
    );
    let trie = MerklePatriciaTrie::new(Arc::new(db), 0);
    for i in 0..entries {
        let key = i.to_be_bytes();
        trie.insert(&Path::from_bytes(&key), &format!("value-{i}").into_bytes())
            .unwrap();
    }
    trie
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("insert_1k", |b| {
        b.iter(|| black_box(populated_trie(1_000)))
    });
}

fn bench_get(c: &mut Criterion) {
    let trie = populated_trie(1_000);
    c.bench_function("get_hit", |b| {
        b.iter(|| {
            let key = 567u32.to_be_bytes();
            black_box(trie.get::<Vec<u8>>(&Path::from_bytes(&key)).unwrap())
        })
    });
}

fn bench_iterate(c: &mut Criterion) {
    let trie = populated_trie(1_000);
    let ctx = OpContext::background();
    c.bench_function("iterate_1k", |b| {
        b.iter(|| {
            let mut count = 0u32;
            trie.iterate(
                &ctx,
                &mut |_path, _key, _node| {
                    count += 1;
                    Ok(())
                },
                NODE_TYPES_ALL,
            )
            .unwrap();
            black_box(count)
        })
    });
}

criterion_group!(benches, bench_insert, bench_get, bench_iterate);
criterion_main!(benches);
