use gumdrop::Options;
use httpmock::MockServer;
use std::io::{self, BufRead};

use skein::config::SkeinConfiguration;
use skein::prelude::*;

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

/// The following options are configured by default, if not set to a custom value:
///  --host <mock-server>, when a mock server is given
///  --no-print-metrics
#[allow(dead_code)]
pub fn build_configuration(server: Option<&MockServer>, custom: Vec<&str>) -> SkeinConfiguration {
    // Start with an empty configuration.
    let mut configuration: Vec<&str> = vec![];
    // Declare server_url here no matter what, so its lifetime is sufficient when needed.
    let server_url = server.map(|server| server.base_url()).unwrap_or_default();

    // Merge in all custom options first.
    configuration.extend_from_slice(&custom);

    // Default to using mock server if not otherwise configured.
    if server.is_some() && !configuration.contains(&"--host") {
        configuration.extend_from_slice(&["--host", &server_url]);
    }

    // Keep test output readable.
    if !configuration.contains(&"--no-print-metrics") {
        configuration.push("--no-print-metrics");
    }

    // Parse these options to generate a SkeinConfiguration.
    SkeinConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// Create a LoadTest from the configuration and the scenarios, each bound to its
/// own workload.
#[allow(dead_code)]
pub fn build_load_test(configuration: SkeinConfiguration, scenarios: Vec<Scenario>) -> LoadTest {
    let mut load_test = LoadTest::initialize_with_config(configuration).unwrap();
    for scenario in scenarios {
        load_test = load_test.register_scenario(scenario);
    }
    load_test
}

/// Run the load test, returning the RunResult.
#[allow(dead_code)]
pub async fn run_load_test(load_test: LoadTest) -> RunResult {
    load_test.execute().await.unwrap()
}

/// Helper to count the number of lines in a test artifact.
#[allow(dead_code)]
pub fn file_length(file_name: &str) -> usize {
    if let Ok(file) = std::fs::File::open(std::path::Path::new(file_name)) {
        io::BufReader::new(file).lines().count()
    } else {
        0
    }
}

/// Helper to delete test artifacts, if existing.
#[allow(dead_code)]
pub fn cleanup_files(files: Vec<&str>) {
    for file in files {
        if std::path::Path::new(file).exists() {
            std::fs::remove_file(file).expect("failed to remove file");
        }
    }
}
