use line_item_normalizer::*;
use rust_decimal::Decimal;
use std::collections::BTreeSet;

fn at(cell: &str) -> SourceLocation {
    SourceLocation::new("PL", cell)
}

fn yen(amount: i64) -> Option<Decimal> {
    Some(Decimal::from(amount))
}

fn engine() -> Engine {
    Engine::with_builtin().unwrap()
}

fn run(candidates: Vec<Candidate>) -> RunOutput {
    engine()
        .run("決算書.xlsx", Ok(candidates), BUILTIN_TAXONOMY_VERSION)
        .unwrap()
}

/// Every candidate must end up in some provenance list, in the review queue,
/// or both.
fn assert_no_loss(candidates: &[Candidate], run: &RunOutput) {
    let mut seen: BTreeSet<SourceLocation> = run
        .output
        .values
        .values()
        .flat_map(|v| v.provenance.iter().cloned())
        .collect();
    seen.extend(run.review.items.iter().map(|i| i.candidate.source_location.clone()));

    for candidate in candidates {
        assert!(
            seen.contains(&candidate.source_location),
            "candidate at {} was lost",
            candidate.source_location
        );
    }
}

fn full_statement() -> Vec<Candidate> {
    vec![
        Candidate::new("売上高", "120,000", Some("千円"), at("C3")),
        Candidate::new("売上原価", "80,000", Some("千円"), at("C4")),
        Candidate::new("売上総利益", "40,000", Some("千円"), at("C5")),
        Candidate::new("販売費及び一般管理費", "30,000", Some("千円"), at("C6")),
        Candidate::new("営業利益", "10,000", Some("千円"), at("C7")),
        Candidate::new("営業外収益", "500", Some("千円"), at("C8")),
        Candidate::new("営業外費用", "1,500", Some("千円"), at("C9")),
        Candidate::new("経常利益", "9,000", Some("千円"), at("C10")),
        Candidate::new("税引前当期純利益", "9,000", Some("千円"), at("C11")),
        Candidate::new("法人税等", "2,700", Some("千円"), at("C12")),
        Candidate::new("当期純利益", "6,300", Some("千円"), at("C13")),
    ]
}

#[test]
fn test_label_suffix_unit_scenario() {
    let candidates = vec![Candidate::new("売上高（千円）", 12345, None, at("C3"))];
    let run = run(candidates);

    let revenue = run.output.value("revenue").unwrap();
    assert_eq!(revenue.amount_in_canonical_unit, Decimal::from(12_345_000));
    assert!(revenue.unit_confirmed);
    assert!(!revenue.sign_applied);
    assert_eq!(revenue.match_method, MatchMethod::NormalizedSynonym);
    assert_eq!(run.output.canonical_unit, "円");
}

#[test]
fn test_undeclared_english_label_scenario() {
    let candidates = vec![
        Candidate::new("売上高", 100000, Some("円"), at("C3")),
        Candidate::new("Sales", 100000, Some("円"), at("H3")),
    ];
    let run = run(candidates.clone());

    let revenue = run.output.value("revenue").unwrap();
    assert_eq!(revenue.match_method, MatchMethod::Exact);
    assert_eq!(revenue.provenance, vec![at("C3")]);

    assert_eq!(run.review.len(), 1);
    let item = &run.review.items[0];
    assert_eq!(item.reason, ReviewReason::Unmatched);
    assert_eq!(item.candidate.raw_label, "Sales");
    assert_no_loss(&candidates, &run);
}

#[test]
fn test_conflicting_values_scenario() {
    let candidates = vec![
        Candidate::new("営業利益", 5000, Some("千円"), at("C9")),
        Candidate::new("営業利益", 4000, Some("千円"), at("D9")),
    ];
    let run = run(candidates.clone());

    assert!(run.output.value("operating_income").is_none());
    assert!(run
        .output
        .missing_required
        .contains(&"operating_income".to_string()));
    assert_eq!(run.review.count_by_reason(ReviewReason::Conflicting), 2);
    let cells: Vec<&str> = run
        .review
        .items
        .iter()
        .map(|i| i.candidate.source_location.cell.as_str())
        .collect();
    assert_eq!(cells, vec!["C9", "D9"]);
    assert_no_loss(&candidates, &run);
}

#[test]
fn test_complete_statement_has_no_missing_required() {
    let candidates = full_statement();
    let run = run(candidates.clone());

    assert!(run.output.is_complete(), "missing: {:?}", run.output.missing_required);
    assert!(run.review.is_empty());
    assert!(run.discrepancies.is_empty());
    assert_eq!(run.output.amount("net_income"), yen(6_300_000));
    assert_no_loss(&candidates, &run);
}

#[test]
fn test_runs_are_byte_identical() {
    let mut candidates = full_statement();
    candidates.push(Candidate::new("Sales", 1, Some("円"), at("H3")));
    candidates.push(Candidate::new("営業利益", "9,000", Some("千円"), at("H7")));
    candidates.push(Candidate::new("売上高計", "120,000", Some("千円"), at("H9")));

    let first = run(candidates.clone());
    let second = run(candidates);

    assert_eq!(first.output.to_json().unwrap(), second.output.to_json().unwrap());
    assert_eq!(first.review.to_json().unwrap(), second.review.to_json().unwrap());
    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
}

#[test]
fn test_duplicate_subtotal_rows_merge() {
    let candidates = vec![
        Candidate::new("売上高", "120,000", Some("千円"), at("C3")),
        Candidate::new("売上高合計", "120,000,000", Some("円"), at("F20")),
    ];
    let run = run(candidates.clone());

    let revenue = run.output.value("revenue").unwrap();
    assert_eq!(revenue.amount_in_canonical_unit, Decimal::from(120_000_000));
    assert_eq!(revenue.provenance, vec![at("C3"), at("F20")]);
    assert!(run.review.is_empty());
    assert_no_loss(&candidates, &run);
}

#[test]
fn test_loss_labels_report_negative_profit() {
    let candidates = vec![
        Candidate::new("営業損失", "△1,200", Some("千円"), at("C7")),
        Candidate::new("当期純損失", "2,000", Some("千円"), at("C13")),
    ];
    let run = run(candidates);

    assert_eq!(run.output.amount("operating_income"), yen(-1_200_000));
    assert!(!run.output.value("operating_income").unwrap().sign_applied);
    assert_eq!(run.output.amount("net_income"), yen(-2_000_000));
    assert!(run.output.value("net_income").unwrap().sign_applied);
}

#[test]
fn test_empty_extraction_is_not_an_error() {
    let run = run(vec![]);

    assert!(run.output.values.is_empty());
    assert!(run.review.is_empty());
    let taxonomy = Taxonomy::builtin().unwrap();
    assert_eq!(
        run.output.missing_required.len(),
        taxonomy.required_concepts().count()
    );
}

#[test]
fn test_extraction_failure_produces_no_record() {
    let result = engine().run(
        "決算書.xlsx",
        Err(ExtractionError::Fatal("unreadable workbook".to_string())),
        BUILTIN_TAXONOMY_VERSION,
    );
    assert!(matches!(result, Err(NormalizerError::ExtractionFailed { .. })));
}

#[test]
fn test_identity_discrepancy_is_reported_not_fixed() {
    let mut candidates = full_statement();
    candidates[2] = Candidate::new("売上総利益", "45,000", Some("千円"), at("C5"));
    let run = run(candidates);

    assert_eq!(run.output.amount("gross_profit"), yen(45_000_000));
    let ids: Vec<&str> = run
        .discrepancies
        .iter()
        .map(|d| d.concept_id.as_str())
        .collect();
    assert_eq!(ids, vec!["gross_profit", "operating_income"]);
}

#[test]
fn test_template_output_is_ordered() {
    let run = run(full_statement());
    let taxonomy = Taxonomy::builtin().unwrap();
    let template = run.output.to_template(&taxonomy);

    let names: Vec<&str> = template.rows.iter().take(3).map(|r| r.display_name.as_str()).collect();
    assert_eq!(names, vec!["売上高", "売上原価", "売上総利益"]);
    assert_eq!(template.rows[0].amount, yen(120_000_000));

    let ebitda = template.rows.iter().find(|r| r.concept_id == "ebitda").unwrap();
    assert_eq!(ebitda.amount, None);
}

#[test]
fn test_sheets_with_adjacent_cell_extractor() {
    let sheet = SheetInput::new("損益計算書")
        .with_unit_note("（単位：千円）")
        .with_block(CellBlock::new("B3", "売上高", vec![ValueCell::new("C3", "12,000")]))
        .with_block(CellBlock::new(
            "B4",
            "売上原価",
            vec![ValueCell::new("C4", "-"), ValueCell::new("D4", "7,000")],
        ))
        .with_block(CellBlock::new("B5", "注記", vec![ValueCell::new("C5", "別紙参照")]));

    let run = normalize_sheets(&[sheet]).unwrap();

    assert_eq!(run.output.amount("revenue"), yen(12_000_000));
    assert_eq!(run.output.amount("cost_of_sales"), yen(7_000_000));
    assert_eq!(
        run.output.value("cost_of_sales").unwrap().provenance,
        vec![SourceLocation::new("損益計算書", "D4")]
    );
}

#[test]
fn test_batch_isolates_failures() {
    let report = engine()
        .run_batch(
            vec![
                ("2023.xlsx".to_string(), Ok(full_statement())),
                (
                    "2024.xlsx".to_string(),
                    Err(ExtractionError::Transient("timeout".to_string())),
                ),
                ("2025.xlsx".to_string(), Ok(vec![])),
            ],
            BUILTIN_TAXONOMY_VERSION,
        )
        .unwrap();

    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.total_extracted_items(), full_statement().len());

    let sources: Vec<&str> = report.entries.iter().map(|e| e.source.as_str()).collect();
    assert_eq!(sources, vec!["2023.xlsx", "2024.xlsx", "2025.xlsx"]);
    assert_eq!(report.entries[1].status, BatchStatus::Failed);
    assert!(report.entries[1].error.as_deref().unwrap().contains("2024.xlsx"));
    assert!(report.to_markdown().contains("| 2025.xlsx | success | 0 |"));
}

#[test]
fn test_review_then_dispositions() -> anyhow::Result<()> {
    let candidates = vec![
        Candidate::new("売上高", "120,000", Some("千円"), at("C3")),
        Candidate::new("営業利益", 5000, Some("千円"), at("C9")),
        Candidate::new("営業利益", 4000, Some("千円"), at("D9")),
    ];
    let run = run(candidates);
    let taxonomy = Taxonomy::builtin()?;

    let dispositions: Vec<ReviewDisposition> = serde_json::from_str(
        r#"[
            { "action": "assign", "item_index": 1, "concept_id": "operating_income" },
            { "action": "dismiss", "item_index": 0, "note": "prior-year column" }
        ]"#,
    )?;
    let outcome = apply_dispositions(
        &run.output,
        &run.review,
        &dispositions,
        &taxonomy,
        &UnitNormalizer::new(),
    )?;

    assert_eq!(outcome.record.amount("operating_income"), yen(4_000_000));
    assert!(!outcome
        .record
        .missing_required
        .contains(&"operating_income".to_string()));
    assert!(run.output.value("operating_income").is_none());
    assert!(outcome.unapplied.is_empty());
    Ok(())
}

#[test]
fn test_oracle_json_round_trip_through_engine() -> anyhow::Result<()> {
    let json = r#"[
        { "raw_label": "売上高", "raw_value": "１２，０００", "raw_unit_token": "百万円",
          "source_location": { "sheet": "PL", "cell": "C3" } },
        { "raw_label": "経常損失", "raw_value": 15, "raw_unit_token": "百万円",
          "source_location": { "sheet": "PL", "cell": "C10" }, "extraction_confidence": 0.9 }
    ]"#;

    let run = engine().run("oracle", candidates_from_json(json), BUILTIN_TAXONOMY_VERSION)?;
    assert_eq!(run.output.amount("revenue"), yen(12_000_000_000));
    assert_eq!(run.output.amount("ordinary_income"), yen(-15_000_000));

    let schema = Candidate::extraction_schema_json()?;
    assert!(schema.contains("raw_unit_token"));
    Ok(())
}

#[test]
fn test_custom_taxonomy_version() -> anyhow::Result<()> {
    let source = r#"{
        "version": "jp-pl-mini",
        "concepts": [
            { "id": "revenue", "display_name": "売上高", "expected_sign": "positive", "required": true },
            { "id": "operating_income", "display_name": "営業利益", "expected_sign": "either",
              "loss_synonyms": ["営業損失"], "required": true }
        ]
    }"#;

    let mut registry = TaxonomyRegistry::with_builtin()?;
    registry.register(Taxonomy::from_json_str(source)?)?;
    let engine = Engine::new(registry, EngineConfig::default())?;

    let run = engine.run(
        "mini.xlsx",
        Ok(vec![Candidate::new("売上原価", 10, Some("円"), at("C4"))]),
        "jp-pl-mini",
    )?;
    assert_eq!(run.output.taxonomy_version, "jp-pl-mini");
    assert_eq!(run.output.missing_required, vec!["revenue", "operating_income"]);
    assert_eq!(run.review.count_by_reason(ReviewReason::Unmatched), 1);
    Ok(())
}
