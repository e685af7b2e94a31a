//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use tidyrun_e2e::{NodeStatus, PipelineResult, TestResult, TestStatus};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn print_serialized<T: Serialize + ?Sized>(value: &T, format: OutputFormat) {
    match format {
        OutputFormat::Json => match serde_json::to_string_pretty(value) {
            Ok(s) => println!("{}", s),
            Err(e) => print_error(&format!("failed to encode output: {}", e)),
        },
        OutputFormat::Yaml => match serde_yaml::to_string(value) {
            Ok(s) => print!("{}", s),
            Err(e) => print_error(&format!("failed to encode output: {}", e)),
        },
        OutputFormat::Table => {}
    }
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    if let OutputFormat::Table = format {
        if items.is_empty() {
            println!("No items found.");
            return;
        }
        let mut table = table();
        table.set_header(T::headers());
        for item in items {
            table.add_row(item.row());
        }
        println!("{table}");
    } else {
        print_serialized(items, format);
    }
}

fn test_status(status: TestStatus) -> String {
    match status {
        TestStatus::Passed => "passed".green().to_string(),
        TestStatus::Failed => "failed".red().to_string(),
        TestStatus::NotRun => "not run".dimmed().to_string(),
    }
}

fn node_status(status: NodeStatus) -> String {
    match status {
        NodeStatus::Passed => "passed".green().to_string(),
        NodeStatus::Failed => "failed".red().to_string(),
        NodeStatus::Skipped => "skipped".yellow().to_string(),
    }
}

impl TableDisplay for TestResult {
    fn headers() -> Vec<&'static str> {
        vec!["Test", "Status", "Duration", "Error"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.label(),
            test_status(self.status),
            format!("{}ms", self.duration_ms),
            self.error.clone().unwrap_or_default(),
        ]
    }
}

/// Print a finished run: nodes, tests, then cleanup.
pub fn print_pipeline(result: &PipelineResult, format: OutputFormat) {
    if !matches!(format, OutputFormat::Table) {
        print_serialized(result, format);
        return;
    }

    println!("{} {} ({})", "Pipeline".bold(), result.name, result.session_id);

    if result.nodes.len() > 1 {
        let mut nodes = table();
        nodes.set_header(vec!["Workflow", "Status", "Duration", "Reason"]);
        for node in &result.nodes {
            nodes.add_row(vec![
                node.id.clone(),
                node_status(node.status),
                format!("{}ms", node.duration_ms),
                node.reason.clone().unwrap_or_default(),
            ]);
        }
        println!("{nodes}");
    }

    let tests: Vec<_> = result.tests().cloned().collect();
    if !tests.is_empty() {
        let mut table = table();
        table.set_header(TestResult::headers());
        for test in &tests {
            table.add_row(test.row());
        }
        println!("{table}");
    }

    let passed = tests.iter().filter(|t| t.status == TestStatus::Passed).count();
    println!("{} of {} tests passed in {}ms", passed, tests.len(), result.duration_ms);

    match &result.cleanup {
        Some(cleanup) if cleanup.success => {
            print_success(&format!("Cleanup deleted {} resources", cleanup.deleted.len()));
        }
        Some(cleanup) => {
            print_warning(&format!(
                "Cleanup left {} resources behind:",
                cleanup.failed.len()
            ));
            for label in &cleanup.failed {
                println!("    {}", label);
            }
            if let Some(path) = &cleanup.record_path {
                print_info(&format!(
                    "Recorded in {}; run `tidyrun cleanup retry {}` later",
                    path.display(),
                    result.session_id
                ));
            }
        }
        None => {}
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("ℹ️  {}", message);
}
