//! Unit tests grouped by module, with a per-module dependency hash cache.

use std::collections::HashMap;
use std::path::Path;

use futures::{FutureExt, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use shipwright_state::LineKind;
use tracing::{debug, info, warn};

use super::batch::{BatchItem, BatchSummary, LineReport, LineWriter};
use super::instance::{parse_file_list, Instance};
use super::TestSettings;
use crate::error::{Result, ShipwrightError};
use crate::remote::shell_quote;

/// Test files grouped by owning module, in order of first appearance.
///
/// The module of `addons/sale/tests/test_x.py` is `sale`.
pub fn group_by_module(files: &[String]) -> Vec<(String, Vec<String>)> {
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for file in files {
        let module = Path::new(file)
            .parent()
            .and_then(Path::parent)
            .and_then(Path::file_name)
            .map(|m| m.to_string_lossy().into_owned())
            .unwrap_or_default();
        let idx = match groups.iter().position(|(m, _)| *m == module) {
            Some(idx) => idx,
            None => {
                groups.push((module, Vec::new()));
                groups.len() - 1
            }
        };
        if !groups[idx].1.contains(file) {
            groups[idx].1.push(file.clone());
        }
    }
    groups
}

/// Last three path components, `sale/tests/test_x.py`.
pub fn display_path(file: &str) -> String {
    let parts: Vec<&str> = file.split('/').filter(|p| !p.is_empty()).collect();
    parts[parts.len().saturating_sub(3)..].join("/")
}

/// Hash over the checksums of every file the module depends on.
async fn module_hash(instance: &Instance, module: &str) -> Result<String> {
    let out = instance
        .cli(&format!("list-deps {}", shell_quote(module)))
        .await?;
    let mut deps = parse_file_list(&out.stdout).ok_or_else(|| {
        ShipwrightError::Validation(format!("no dependency list for module {module}"))
    })?;
    deps.sort();

    let mut hasher = Sha256::new();
    hasher.update(module.as_bytes());
    for dep in deps {
        let sums = instance
            .session()
            .run(&format!(
                "find {} -type f -print0 | sort -z | xargs -0 -r sha256sum",
                shell_quote(&dep)
            ))
            .await?;
        hasher.update(dep.as_bytes());
        hasher.update(sums.stdout.as_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hashes of all modules, at most `workers` computed at a time.
pub(crate) async fn module_hashes(
    instance: &Instance,
    modules: &[String],
    workers: usize,
) -> Result<HashMap<String, String>> {
    futures::stream::iter(modules.iter().cloned())
        .map(|module| async move {
            let hash = module_hash(instance, &module).await?;
            Ok::<_, ShipwrightError>((module, hash))
        })
        .buffer_unordered(workers.max(1))
        .try_collect()
        .await
}

pub(super) async fn run(
    instance: &Instance,
    writer: &mut LineWriter,
    settings: &TestSettings,
) -> Result<BatchSummary> {
    let listing = if settings.unittest_all {
        "list-unit-test-files --all"
    } else {
        "list-unit-test-files"
    };
    let files = instance.list_files(listing).await?;
    let modules = group_by_module(&files);
    let names: Vec<String> = modules.iter().map(|(m, _)| m.clone()).collect();
    let hashes = module_hashes(instance, &names, settings.hash_workers).await?;
    info!(modules = modules.len(), files = files.len(), "unit tests listed");

    let total = modules.len();
    let mut summary = BatchSummary::default();
    for (i, (module, tests)) in modules.into_iter().enumerate() {
        let hash = hashes.get(&module).cloned();
        let items: Vec<BatchItem> = tests
            .iter()
            .map(|file| BatchItem {
                name: format!("({} / {total}) {}", i + 1, display_path(file)),
                unique_name: Some(file.clone()),
                hash: hash.clone(),
                ..BatchItem::new("", file.clone())
            })
            .collect();

        let mut all_cached = true;
        for item in &items {
            if !writer.is_cached(item).await? {
                all_cached = false;
                break;
            }
        }

        if !all_cached {
            instance.restore_snapshot().await?;
            let install = writer
                .run_batch(
                    LineKind::Unittest,
                    vec![BatchItem::new(format!("install {module}"), module.clone())],
                    1,
                    |item| {
                        async move {
                            instance
                                .cli(&format!("update {}", shell_quote(&item.target)))
                                .await?;
                            Ok::<_, ShipwrightError>(LineReport::default())
                        }
                        .boxed()
                    },
                )
                .await?;
            if install.aborted {
                return Ok(install);
            }
            if install.failed > 0 {
                warn!(module = %module, "install failed, skipping its tests");
                continue;
            }
            instance.wait_for_postgres().await?;
        } else {
            debug!(module = %module, "every test of module cached");
        }

        let done = writer
            .run_batch(LineKind::Unittest, items, settings.retry_count, |item| {
                async move {
                    instance
                        .cli_timed(&format!(
                            "unittest {} --non-interactive",
                            shell_quote(&item.target)
                        ))
                        .await?;
                    Ok::<_, ShipwrightError>(LineReport::default())
                }
                .boxed()
            })
            .await?;
        summary.succeeded += done.succeeded;
        summary.failed += done.failed;
        if done.aborted {
            summary.aborted = true;
            break;
        }
    }
    Ok(summary)
}
