use super::*;

fn chunker(chunk_size: usize, overlap: usize) -> Chunker {
    Chunker::new(ChunkingConfig {
        chunk_size,
        overlap,
    })
    .expect("chunking config should be valid")
}

fn reconstruct(spans: &[ChunkSpan]) -> String {
    spans.iter().map(ChunkSpan::fresh_text).collect()
}

fn assert_well_formed(text: &str, spans: &[ChunkSpan], chunk_size: usize, overlap: usize) {
    assert_eq!(reconstruct(spans), text, "spans should cover the text exactly");

    for (i, span) in spans.iter().enumerate() {
        assert_eq!(span.index, i);
        assert!(!span.text.is_empty());
        assert!(span.char_len() <= chunk_size, "span {} is too long", i);
        assert_eq!(span.text.chars().count(), span.char_len());
    }

    for pair in spans.windows(2) {
        let prev: Vec<char> = pair[0].text.chars().collect();
        let shared: String = prev[prev.len() - overlap..].iter().collect();
        let next_prefix: String = pair[1].text.chars().take(overlap).collect();
        assert_eq!(pair[1].overlap, overlap);
        assert_eq!(shared, next_prefix, "consecutive spans should share the overlap");
    }
}

#[test]
fn empty_text() {
    let spans = chunker(1000, 200).chunk("");
    assert!(spans.is_empty());
}

#[test]
fn short_text_is_single_chunk() {
    let text = "A short paragraph.\n\nAnd another one.";
    let spans = chunker(1000, 200).chunk(text);

    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].text, text);
    assert_eq!(spans[0].overlap, 0);
    assert_eq!(spans[0].start, 0);
    assert_eq!(spans[0].end, text.chars().count());
}

#[test]
fn text_of_exactly_chunk_size_is_single_chunk() {
    let text = "z".repeat(1000);
    let spans = chunker(1000, 200).chunk(&text);
    assert_eq!(spans.len(), 1);
}

#[test]
fn invalid_configuration_is_rejected_at_construction() {
    assert!(matches!(
        Chunker::new(ChunkingConfig {
            chunk_size: 100,
            overlap: 100,
        }),
        Err(ConfigError::OverlapTooLarge(100, 100))
    ));
    assert!(matches!(
        Chunker::new(ChunkingConfig {
            chunk_size: 100,
            overlap: 250,
        }),
        Err(ConfigError::OverlapTooLarge(250, 100))
    ));
    assert!(matches!(
        Chunker::new(ChunkingConfig {
            chunk_size: 0,
            overlap: 0,
        }),
        Err(ConfigError::InvalidChunkSize(0))
    ));
    assert!(chunk_text("anything", 10, 10).is_err());
}

#[test]
fn hard_cutoff_with_default_sizes() {
    let text = "a".repeat(2500);
    let spans = chunk_text(&text, 1000, 200).expect("default sizes are valid");

    let lengths: Vec<usize> = spans.iter().map(ChunkSpan::char_len).collect();
    assert_eq!(lengths, vec![1000, 1000, 900]);
    assert_eq!(
        spans.iter().map(|s| (s.start, s.end)).collect::<Vec<_>>(),
        vec![(0, 1000), (800, 1800), (1600, 2500)]
    );
    assert_well_formed(&text, &spans, 1000, 200);
}

#[test]
fn prefers_paragraph_breaks() {
    let text = format!(
        "{}\n\n{}\n\n{}",
        "a".repeat(400),
        "b".repeat(400),
        "c".repeat(400)
    );
    let spans = chunker(1000, 100).chunk(&text);

    assert_eq!(spans.len(), 2);
    assert_eq!(spans[0].end, 804);
    assert!(spans[0].text.ends_with("b\n\n"));
    assert_well_formed(&text, &spans, 1000, 100);
}

#[test]
fn falls_back_to_sentence_breaks() {
    let text = "abcdefghij klmnopqrs. ".repeat(60);
    let spans = chunker(1000, 0).chunk(&text);

    assert_eq!(spans[0].end, 990);
    assert!(spans[0].text.ends_with(". "));
    assert_well_formed(&text, &spans, 1000, 0);
}

#[test]
fn does_not_split_inside_code_block() {
    let block = format!("```rust\n{}```\n", "let a = 1;\n".repeat(40));
    let text = format!("{}\n\n{}\n{}", "x".repeat(700), block, "y".repeat(300));
    let spans = chunker(1000, 50).chunk(&text);

    let block_start = 702;
    let block_end = block_start + block.chars().count();
    for span in &spans[..spans.len() - 1] {
        assert!(
            !(block_start < span.end && span.end < block_end),
            "span ended inside the fenced block at {}",
            span.end
        );
    }
    assert!(spans.iter().any(|s| s.text.contains(&block)));
    assert_well_formed(&text, &spans, 1000, 50);
}

#[test]
fn ignores_paragraph_breaks_inside_code_block() {
    let text = format!(
        "{}\n\n```\n{}```\n{}",
        "p".repeat(600),
        "code line\n\n".repeat(50),
        "q".repeat(200)
    );
    let spans = chunker(1000, 100).chunk(&text);

    assert_eq!(spans[0].end, 602);
    assert_well_formed(&text, &spans, 1000, 100);
}

#[test]
fn code_block_straddling_the_window_moves_to_the_next_span() {
    let block = format!("```\n{}\n```", "a".repeat(73));
    let text = format!("{}\n{}\n{}", "x".repeat(29), block, "z".repeat(200));
    let spans = chunker(100, 10).chunk(&text);

    assert_eq!(spans[0].end, 30);
    assert!(spans[1].text.contains(&block));
    assert_well_formed(&text, &spans, 100, 10);
}

#[test]
fn oversized_code_block_is_cut_hard() {
    let text = format!("```\n{}\n```\n", "0123456789".repeat(300));
    let spans = chunker(1000, 200).chunk(&text);

    assert!(spans.len() > 1);
    assert_eq!(spans[0].end, 1000);
    assert_well_formed(&text, &spans, 1000, 200);
}

#[test]
fn code_mode_cuts_at_definitions() {
    let function = |name: &str| {
        format!(
            "fn {}() {{\n{}}}\n",
            name,
            "    let value = 1;\n".repeat(20)
        )
    };
    let text = format!("{}{}{}", function("alpha"), function("beta"), function("gamma"));
    let chunker = chunker(1000, 100);

    let spans = chunker.chunk_code(&text);
    assert_eq!(spans.len(), 2);
    assert!(spans[0].text.starts_with("fn alpha"));
    assert!(spans[0].text.ends_with("}\n"));
    assert!(spans[1].fresh_text().starts_with("fn gamma"));
    assert_well_formed(&text, &spans, 1000, 100);

    let prose_spans = chunker.chunk(&text);
    assert_eq!(prose_spans[0].end, 1000);
}

#[test]
fn code_mode_recognises_python_definitions() {
    let method = |name: &str| format!("    def {}(self):\n{}\n", name, "        x = 1\n".repeat(8));
    let text = format!(
        "class Client:\n{}{}{}{}",
        method("connect"),
        method("send"),
        method("receive"),
        method("close")
    );
    let spans = chunker(300, 50).chunk_code(&text);

    for span in &spans[1..] {
        assert!(
            span.fresh_text().trim_start().starts_with("def "),
            "span should start at a definition: {:?}",
            span.fresh_text()
        );
    }
    assert_well_formed(&text, &spans, 300, 50);
}

#[test]
fn multibyte_text_is_measured_in_characters() {
    let text = "日本語のドキュメント。Ünïcödé façade! ".repeat(30);
    let spans = chunker(100, 10).chunk(&text);

    assert!(spans.len() > 1);
    assert_well_formed(&text, &spans, 100, 10);
}

#[test]
fn coverage_holds_for_mixed_documents() {
    let documents = [
        "Intro paragraph. It has two sentences.\n\nSecond paragraph!\n\n\n\nThird? Yes.".repeat(40),
        format!(
            "# Guide\n\nInstall it:\n\n```bash\ncargo add demo\n```\n\n{}",
            "Some explanation that goes on. ".repeat(100)
        ),
        "no boundaries at all ".repeat(200),
        "\n".repeat(1500),
    ];
    let configs = [(1000, 200), (300, 0), (128, 127), (50, 10)];

    for document in &documents {
        for &(size, overlap) in &configs {
            let spans = chunker(size, overlap).chunk(document);
            assert_well_formed(document, &spans, size, overlap);

            let code_spans = chunker(size, overlap).chunk_code(document);
            assert_well_formed(document, &code_spans, size, overlap);
        }
    }
}

#[test]
fn chunking_is_deterministic() {
    let text = format!(
        "{}\n\n```\nfn main() {{}}\n```\n\n{}",
        "First part. ".repeat(90),
        "Second part! ".repeat(90)
    );
    let chunker = chunker(400, 80);

    assert_eq!(chunker.chunk(&text), chunker.chunk(&text));
    assert_eq!(chunker.chunk_code(&text), chunker.chunk_code(&text));
}
