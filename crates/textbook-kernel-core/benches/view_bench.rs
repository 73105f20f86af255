use criterion::{criterion_group, criterion_main, Criterion};
use textbook_kernel_core::{
    assemble_passage_set_views, DocumentId, PassageSet, Textbook, TextbookPassageMapping,
};
use time::OffsetDateTime;

fn mk_textbook(index: usize) -> Textbook {
    Textbook {
        id: DocumentId(format!("textbook-{index}")),
        title: format!("Reading {index}"),
        subject: "English".to_string(),
        level: "high".to_string(),
        year: 2024,
        description: None,
        created_at: OffsetDateTime::UNIX_EPOCH,
        updated_at: OffsetDateTime::UNIX_EPOCH,
    }
}

fn mk_passage_set(index: usize) -> PassageSet {
    PassageSet {
        id: DocumentId(format!("set-{index}")),
        title: format!("Passage {index}"),
        passage: "benchmark passage body".to_string(),
        passage_comment: None,
        qr_code: None,
        qr_code_url: None,
        created_at: OffsetDateTime::UNIX_EPOCH,
        updated_at: OffsetDateTime::UNIX_EPOCH,
    }
}

fn fixture(
    textbooks: usize,
    sets_per_textbook: usize,
) -> (Vec<Textbook>, Vec<PassageSet>, Vec<TextbookPassageMapping>) {
    let books = (0..textbooks).map(mk_textbook).collect::<Vec<_>>();
    let sets = (0..sets_per_textbook).map(mk_passage_set).collect::<Vec<_>>();
    let mut mappings = Vec::with_capacity(textbooks * sets_per_textbook);
    for book in 0..textbooks {
        for set in 0..sets_per_textbook {
            mappings.push(TextbookPassageMapping {
                id: DocumentId(format!("mapping-{book}-{set}")),
                textbook_id: DocumentId(format!("textbook-{book}")),
                passage_set_id: DocumentId(format!("set-{set}")),
                order: u32::try_from(sets_per_textbook - set).unwrap_or(u32::MAX),
                qr_code: format!("QR-{book}-{set}"),
                qr_code_url: None,
                created_at: OffsetDateTime::UNIX_EPOCH,
                updated_at: OffsetDateTime::UNIX_EPOCH,
            });
        }
    }
    (books, sets, mappings)
}

fn bench_passage_set_views(c: &mut Criterion) {
    let (books, sets, mappings) = fixture(20, 200);
    let target = DocumentId("textbook-3".to_string());

    c.bench_function("assemble_passage_set_views_20x200", |b| {
        b.iter(|| assemble_passage_set_views(&target, &mappings, &sets, &books));
    });
}

criterion_group!(benches, bench_passage_set_views);
criterion_main!(benches);
