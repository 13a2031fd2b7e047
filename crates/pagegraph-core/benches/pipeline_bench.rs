use criterion::{criterion_group, criterion_main, Criterion};
use pagegraph_core::memory::MemorySource;
use pagegraph_core::{
    next_id, run, Id, LoadConfig, LoadContext, PairType, Registry, Template, Viewer,
};

/// A root page with `children` children, each with two grandchildren, plus a
/// like from every child author on the root.
fn mk_source(children: usize) -> (MemorySource, Id) {
    let mut source = MemorySource::new();
    let mut ids = Vec::with_capacity(children * 3 + 1);
    let mut current = None;
    for _ in 0..=children * 3 {
        let id = match next_id(current.as_ref()) {
            Ok(id) => id,
            Err(err) => panic!("id allocation failed: {err}"),
        };
        current = Some(id.clone());
        ids.push(id);
    }

    let root = ids[0].clone();
    source.add_wiki(root.as_str(), "Root");
    for index in 0..children {
        let child = &ids[1 + index * 3];
        source
            .add_wiki(child.as_str(), "Child")
            .add_pair(root.as_str(), child.as_str(), PairType::Parent)
            .add_like(root.as_str(), child.as_str(), 1);
        for offset in 1..=2 {
            let grandchild = &ids[1 + index * 3 + offset];
            source
                .add_wiki(grandchild.as_str(), "Grandchild")
                .add_pair(child.as_str(), grandchild.as_str(), PairType::Parent);
        }
    }
    (source, root)
}

fn bench_full_item(c: &mut Criterion) {
    let (source, root) = mk_source(200);
    let config = LoadConfig::default();

    c.bench_function("full_item_load_200_children", |b| {
        b.iter(|| {
            let ctx = LoadContext::new(Viewer::user(Id::new("1")));
            let loaded = run(&source, Registry::with_page(&root, Template::FullItem), &ctx, &config);
            if let Err(err) = loaded {
                panic!("full item benchmark load failed: {err}");
            }
            source.reset_calls();
        });
    });
}

fn bench_outline(c: &mut Criterion) {
    let (source, root) = mk_source(200);
    let config = LoadConfig::default();

    c.bench_function("outline_load_200_children", |b| {
        b.iter(|| {
            let ctx = LoadContext::new(Viewer::anonymous());
            let loaded = run(&source, Registry::with_page(&root, Template::Outline), &ctx, &config);
            if let Err(err) = loaded {
                panic!("outline benchmark load failed: {err}");
            }
            source.reset_calls();
        });
    });
}

criterion_group!(pipeline_benches, bench_full_item, bench_outline);
criterion_main!(pipeline_benches);
