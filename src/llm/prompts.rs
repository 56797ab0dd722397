use crate::config::PipelineConfig;
use crate::error::Result;
use crate::llm::types::AssistResponse;
use crate::schema::{ExtractionResult, RawSheet, VarianceItem, Warning, WarningCode};

pub const SYSTEM_PROMPT_ASSIST: &str = r#"
You extract financial line items from a grid of cells taken from an uploaded document.

## RULES
1. Copy values. Every number and every label you return MUST appear in the grid exactly as written (thousands separators and currency symbols may be dropped).
2. Never calculate, estimate, total, or infer a value. If a field is not written in the grid, leave it null.
3. Skip total, subtotal and grand total lines.
4. Set `row` to the row number shown at the start of the line you copied from (R7 means 7).
5. Choose `kind`:
   - `budget_actual`: rows with a budget (plan) amount and an actual (spent) amount.
   - `procurement`: quotation or bid lines with item codes, quantities, unit prices or line totals.
   - `change_order`: approved change orders / variations with an amount.
   - `unrecognized`: none of the above. Return an empty `items` list.

## OUTPUT
Return ONLY a JSON object matching the schema below. No commentary, no markdown.
"#;

pub const SYSTEM_PROMPT_DRAFT: &str = "You are a real-estate fund financial analyst. \
Write budget-vs-actual variance explanations for investors. \
Always begin with the variance percentage and SAR amount. \
Explain using only the provided drivers and vendor names; do not speculate. \
Conclude with mitigation or reassurance. \
Tone: professional, concise, and non-alarmist. \
Length: 2-4 sentences.";

pub const ARABIC_INSTRUCTION: &str = "ثم قدّم نفس الشرح باللغة العربية بأسلوب مهني وموجز، \
وبنفس القواعد: البدء بنسبة وقيمة التفاوت، ثم السبب من Drivers فقط، ثم التطمين/الإجراء التالي. \
افصل بين الفقرتين بسطر فارغ.";

/// Lists the grid one row per line (`R1: a | b | c`) until `max_chars` is reached.
/// Returns the listing and whether rows were cut.
pub fn render_grid(sheet: &RawSheet, max_chars: usize) -> (String, bool) {
    let mut out = String::new();
    for (i, row) in sheet.rows().iter().enumerate() {
        let cells: Vec<String> = row.iter().map(|c| c.display()).collect();
        if cells.iter().all(|c| c.is_empty()) {
            continue;
        }
        let line = format!("R{}: {}\n", i + 1, cells.join(" | "));
        if out.len() + line.len() > max_chars {
            return (out, true);
        }
        out.push_str(&line);
    }
    (out, false)
}

/// User prompt for the assisted extractor, plus a `truncated_input` warning when
/// the grid had to be cut to fit.
pub fn build_assist_prompt(
    sheet: &RawSheet,
    partial: &ExtractionResult,
    config: &PipelineConfig,
) -> Result<(String, Option<Warning>)> {
    let schema = serde_json::to_string_pretty(&schemars::schema_for!(AssistResponse))?;
    let (grid, truncated) = render_grid(sheet, config.max_llm_input_chars);

    let warning = truncated.then(|| {
        Warning::new(
            WarningCode::TruncatedInput,
            format!(
                "Grid cut to {} characters before the LLM call; later rows were not sent",
                config.max_llm_input_chars
            ),
        )
        .at(sheet.origin().label())
    });

    let findings = match partial.header_row {
        Some(row) => format!(
            "A rule-based pass guessed `{}` with confidence {:.2} using the header on R{} and lifted {} item(s).",
            partial.kind,
            partial.confidence,
            row + 1,
            partial.items.len()
        ),
        None => "A rule-based pass found no header row.".to_string(),
    };

    let prompt = format!(
        "## SOURCE\nFile: {}\nSheet: {}\n\n## EARLIER FINDINGS\n{}\n\n## GRID\n{}\n## SCHEMA\n```json\n{}\n```",
        sheet.origin().file_name,
        sheet.origin().sheet_name,
        findings,
        grid,
        schema
    );
    Ok((prompt, warning))
}

/// User prompt for one variance narrative.
pub fn build_draft_prompt(item: &VarianceItem, bilingual: bool) -> String {
    let join = |values: &[String], empty: &str| {
        if values.is_empty() {
            empty.to_string()
        } else {
            values.join("; ")
        }
    };
    let pct = item
        .variance_pct
        .map(|p| format!("{:.2}", p))
        .unwrap_or_else(|| "n/a (zero budget)".to_string());

    let mut prompt = format!(
        "Project: {}\nPeriod: {}\nCategory: {}\nBudget (SAR): {:.2}\nActual (SAR): {:.2}\n\
         Variance (SAR): {:.2}\nVariance %: {}\nDrivers: {}\nVendors: {}\nEvidence links: {}\n\
         Do not speculate. If a cause is not provided in drivers, state 'cause pending analyst review'.\n\
         Write an English paragraph that starts with the variance percentage and amount, \
         explains cause(s) strictly from Drivers, and closes with mitigation/reassurance.",
        item.project,
        item.period,
        item.category,
        item.budget_sar,
        item.actual_sar,
        item.variance_sar,
        pct,
        join(&item.drivers, "None provided"),
        join(&item.vendors, "N/A"),
        join(&item.evidence_links, "N/A"),
    );
    if bilingual {
        prompt.push_str("\n\n");
        prompt.push_str(ARABIC_INSTRUCTION);
    }
    prompt
}
