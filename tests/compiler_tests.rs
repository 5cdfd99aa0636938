//! Compiler integration tests

use std::sync::Arc;

use address_pipeline::{
    Column, ColumnType, CompilerConfig, CteCompiler, InputTable, OverlapRule, Pipeline,
    PipelineError, Schema, SqlStep, Step, StepRegistry,
};

fn address_input() -> InputTable {
    InputTable::new(
        "raw_addresses",
        Schema::new()
            .with("address", ColumnType::String)
            .with("postcode", ColumnType::String),
    )
}

fn trim_whitespace() -> SqlStep {
    SqlStep::new(
        "trim_whitespace",
        "SELECT * EXCLUDE (address), trim(regexp_replace(address, '\\s+', ' ', 'g')) AS address FROM {input}",
    )
    .requires(["address"])
    .emits(["address"])
}

fn canonicalise_postcode() -> SqlStep {
    SqlStep::new(
        "canonicalise_postcode",
        "SELECT * EXCLUDE (postcode), upper(replace(postcode, ' ', '')) AS postcode FROM {input}",
    )
    .requires(["postcode"])
    .emits(["postcode"])
}

fn cleaning_pipeline() -> Pipeline {
    StepRegistry::new()
        .with_step(trim_whitespace())
        .unwrap()
        .with_step(canonicalise_postcode())
        .unwrap()
        .into_pipeline()
}

#[test]
fn test_trim_and_canonicalise() {
    let compiler = CteCompiler::new(CompilerConfig::new().with_overlap_rule(OverlapRule::KeepPosition));
    let plan = compiler.plan(&cleaning_pipeline(), &address_input()).unwrap();

    let full = plan.compile().unwrap();
    assert_eq!(full.schema(), &address_input().schema);
    assert_eq!(full.fragment_count(), 2);
    assert_eq!(full.terminal(), "s2_canonicalise_postcode__main");
    assert!(full.sql().starts_with("WITH\ns1_trim_whitespace__main AS (\n"));
    assert!(full.sql().contains("FROM raw_addresses\n)"));
    assert!(full.sql().contains("FROM s1_trim_whitespace__main\n)"));
    assert!(full.sql().ends_with("\n\nSELECT * FROM s2_canonicalise_postcode__main"));

    let first = plan.compile_prefix(1).unwrap();
    assert_eq!(first.fragment_count(), 1);
    assert_eq!(first.schema().names(), vec!["address", "postcode"]);
    assert!(first.sql().ends_with("SELECT * FROM s1_trim_whitespace__main"));
    assert!(!first.sql().contains("canonicalise_postcode"));
}

#[test]
fn test_trim_both_columns_then_canonicalise() {
    let trim = SqlStep::new(
        "trim_whitespace",
        "SELECT * EXCLUDE (address, postcode), trim(address) AS address, trim(postcode) AS postcode FROM {input}",
    )
    .requires(["address", "postcode"])
    .emits(["address", "postcode"]);
    let pipeline = StepRegistry::new()
        .with_step(trim)
        .unwrap()
        .with_step(canonicalise_postcode())
        .unwrap()
        .into_pipeline();

    let plan = CteCompiler::default().plan(&pipeline, &address_input()).unwrap();
    let full = plan.compile().unwrap();
    assert_eq!(full.schema(), &address_input().schema);
    assert_eq!(full.fragment_count(), 2);

    let first = plan.compile_prefix(1).unwrap();
    assert_eq!(first.fragment_count(), 1);
    assert_eq!(first.schema(), &address_input().schema);
    assert!(first.sql().ends_with("SELECT * FROM s1_trim_whitespace__main"));
}

#[test]
fn test_overwrite_moves_column_by_default() {
    let query = CteCompiler::default()
        .compile(&cleaning_pipeline(), &address_input())
        .unwrap();
    // each overwrite moves its column to the end
    assert_eq!(query.schema().names(), vec!["address", "postcode"]);

    let pipeline = StepRegistry::new()
        .with_step(trim_whitespace())
        .unwrap()
        .into_pipeline();
    let query = CteCompiler::default().compile(&pipeline, &address_input()).unwrap();
    assert_eq!(query.schema().names(), vec!["postcode", "address"]);
}

#[test]
fn test_missing_flat_number() {
    let pipeline = StepRegistry::new()
        .with_step(trim_whitespace())
        .unwrap()
        .with_step(
            SqlStep::new(
                "split_flat",
                "SELECT *, regexp_extract(flat_number, '[0-9]+') AS flat_digits FROM {input}",
            )
            .requires(["flat_number"])
            .emits([Column::string("flat_digits")]),
        )
        .unwrap()
        .into_pipeline();

    let err = CteCompiler::default()
        .compile(&pipeline, &address_input())
        .unwrap_err();
    match err {
        PipelineError::MissingColumn { step, columns } => {
            assert_eq!(step, "split_flat");
            assert_eq!(columns, vec!["flat_number"]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_duplicate_step_name() {
    let mut registry = StepRegistry::new();
    registry.register(trim_whitespace()).unwrap();
    registry.register(canonicalise_postcode()).unwrap();
    let err = registry.register(trim_whitespace()).unwrap_err();
    assert!(matches!(err, PipelineError::DuplicateStepName(ref n) if n == "trim_whitespace"));
}

#[test]
fn test_compilation_is_deterministic() {
    let compiler = CteCompiler::default();
    let a = compiler.compile(&cleaning_pipeline(), &address_input()).unwrap();
    let b = compiler.compile(&cleaning_pipeline(), &address_input()).unwrap();
    assert_eq!(a.sql(), b.sql());
    assert_eq!(a.fingerprint(), b.fingerprint());
}

#[test]
fn test_empty_pipeline_is_identity() {
    let query = CteCompiler::default()
        .compile(&Pipeline::empty(), &address_input())
        .unwrap();
    assert_eq!(query.sql(), "SELECT * FROM raw_addresses");
    assert_eq!(query.schema(), &address_input().schema);
}

#[test]
fn test_prefix_then_tail_matches_whole() {
    let pipeline = StepRegistry::new()
        .with_step(trim_whitespace())
        .unwrap()
        .with_step(canonicalise_postcode())
        .unwrap()
        .with_step(
            SqlStep::new("postcode_area", "SELECT *, regexp_extract(postcode, '^[A-Z]+') AS area FROM {input}")
                .requires(["postcode"])
                .emits([Column::string("area")]),
        )
        .unwrap()
        .into_pipeline();
    let compiler = CteCompiler::default();
    let whole = compiler.compile(&pipeline, &address_input()).unwrap();

    for k in 0..=pipeline.len() {
        let prefix = compiler.compile_prefix(&pipeline, &address_input(), k).unwrap();
        let rest = InputTable::new("prefix_output", prefix.schema().clone());
        let tail = compiler.compile(&pipeline.tail(k).unwrap(), &rest).unwrap();
        assert_eq!(tail.schema(), whole.schema(), "split at {k}");
    }
}

#[test]
fn test_prefix_out_of_range() {
    let err = CteCompiler::default()
        .compile_prefix(&cleaning_pipeline(), &address_input(), 3)
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidPrefix { requested: 3, available: 2 }));
}

#[test]
fn test_multi_fragment_step() {
    let tokenise = SqlStep::with_fragments(
        "tokenise",
        [
            ("tokens", "SELECT *, string_split(address, ' ') AS tokens FROM {input}"),
            ("counted", "SELECT *, len(tokens) AS token_count FROM {tokens}"),
        ],
    )
    .requires(["address"])
    .emits([Column::unknown("tokens"), Column::numeric("token_count")]);

    let pipeline = StepRegistry::new()
        .with_step(trim_whitespace())
        .unwrap()
        .with_step(tokenise)
        .unwrap()
        .with_step(canonicalise_postcode())
        .unwrap()
        .into_pipeline();
    let query = CteCompiler::default().compile(&pipeline, &address_input()).unwrap();

    assert_eq!(query.fragment_count(), 4);
    assert!(query.sql().contains("s2_tokenise__tokens AS (\nSELECT *, string_split(address, ' ') AS tokens FROM s1_trim_whitespace__main\n)"));
    assert!(query.sql().contains("FROM s2_tokenise__tokens\n)"));
    assert!(query.sql().contains("FROM s2_tokenise__counted\n)"));
    assert_eq!(
        query.schema().names(),
        vec!["address", "tokens", "token_count", "postcode"]
    );
}

#[test]
fn test_forward_fragment_reference() {
    let step = SqlStep::with_fragments(
        "bad",
        [
            ("a", "SELECT * FROM {b}"),
            ("b", "SELECT * FROM {input}"),
        ],
    );
    let pipeline = StepRegistry::new().with_step(step).unwrap().into_pipeline();
    let err = CteCompiler::default()
        .compile(&pipeline, &address_input())
        .unwrap_err();
    assert!(matches!(err, PipelineError::CompilationError { step: Some(ref s), .. } if s == "bad"));
}

#[test]
fn test_error_location_by_line_and_table() {
    let query = CteCompiler::default()
        .compile(&cleaning_pipeline(), &address_input())
        .unwrap();

    let second = &query.steps()[1];
    let line = format!("Binder Error: column not found\n\nLINE {}: SELECT", second.lines.0 + 1);
    assert_eq!(query.locate(&line).unwrap().name, "canonicalise_postcode");

    let by_name = query
        .locate("Catalog Error: Table with name s1_trim_whitespace__main does not exist")
        .unwrap();
    assert_eq!(by_name.index, 1);
}

#[test]
fn test_pipeline_shared_across_threads() {
    let pipeline = cleaning_pipeline();
    let compiler = Arc::new(CteCompiler::default());
    let expected = compiler.compile(&pipeline, &address_input()).unwrap().into_sql();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pipeline = pipeline.clone();
            let compiler = Arc::clone(&compiler);
            std::thread::spawn(move || compiler.compile(&pipeline, &address_input()).map(|q| q.into_sql()))
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), expected);
    }
}

#[derive(Debug)]
struct LowercaseAll {
    required: Vec<String>,
    emitted: Vec<Column>,
}

impl Step for LowercaseAll {
    fn name(&self) -> &str {
        "lowercase_all"
    }

    fn required_columns(&self) -> &[String] {
        &self.required
    }

    fn emitted_columns(&self) -> &[Column] {
        &self.emitted
    }

    fn render(
        &self,
        ctx: &address_pipeline::RenderContext<'_>,
    ) -> address_pipeline::PipelineResult<address_pipeline::RenderedStep> {
        let columns: Vec<String> = ctx
            .schema
            .columns()
            .iter()
            .map(|c| match c.ty {
                ColumnType::String => format!("lower({0}) AS {0}", c.name),
                _ => c.name.clone(),
            })
            .collect();
        Ok(address_pipeline::RenderedStep::single(format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            ctx.input
        )))
    }
}

#[test]
fn test_custom_step_renders_from_upstream_schema() {
    let pipeline = StepRegistry::new()
        .with_step(LowercaseAll {
            required: Vec::new(),
            emitted: Vec::new(),
        })
        .unwrap()
        .into_pipeline();
    let input = InputTable::new(
        "raw_addresses",
        Schema::new()
            .with("id", ColumnType::Numeric)
            .with("address", ColumnType::String),
    );
    let query = CteCompiler::default().compile(&pipeline, &input).unwrap();
    assert!(query.sql().contains("SELECT id, lower(address) AS address FROM raw_addresses"));
    assert_eq!(query.schema(), &input.schema);
}

#[test]
fn test_input_with_repeated_column_rejected() {
    let json = r#"{
        "name": "raw_addresses",
        "schema": [
            {"name": "address", "type": "string"},
            {"name": "address", "type": "numeric"}
        ]
    }"#;
    assert!(serde_json::from_str::<InputTable>(json).is_err());

    let json = r#"{"name": "raw_addresses", "schema": [{"name": "address", "type": "string"}]}"#;
    let input: InputTable = serde_json::from_str(json).unwrap();
    let pipeline = StepRegistry::new()
        .with_step(trim_whitespace())
        .unwrap()
        .into_pipeline();
    let query = CteCompiler::default().compile(&pipeline, &input).unwrap();
    assert_eq!(query.schema().names(), vec!["address"]);
}
