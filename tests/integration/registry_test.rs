//! Tests for the query registry shipped with the repository.

use monthly_extract::registry::QueryRegistry;
use monthly_extract::writer::sanitize_name;
use std::path::PathBuf;

fn example_registry() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("queries.example.toml")
}

#[test]
fn test_example_registry_loads() {
    let registry = QueryRegistry::load_from_file(&example_registry()).unwrap();
    assert_eq!(registry.len(), 18);

    let names: Vec<&str> = registry.tasks().iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names.first(), Some(&"Cupons Ativos"));
    assert_eq!(names.last(), Some(&"Representatividade - Comparação YoY"));
    assert!(names.contains(&"TKT Médio por Nota Fiscal - Por Categoria de Cliente"));
}

#[test]
fn test_example_registry_selects_by_name() {
    let registry = QueryRegistry::load_from_file(&example_registry()).unwrap();
    let subset = registry
        .select(&["Cupons por Categoria", "Compradores Únicos"])
        .unwrap();

    let names: Vec<&str> = subset.tasks().iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["Compradores Únicos", "Cupons por Categoria"]);
}

#[test]
fn test_example_registry_is_read_only() {
    let registry = QueryRegistry::load_from_file(&example_registry()).unwrap();
    registry.ensure_read_only().unwrap();
}

#[test]
fn test_example_registry_names_are_kept_readable() {
    let registry = QueryRegistry::load_from_file(&example_registry()).unwrap();
    for task in registry.tasks() {
        let sanitized = sanitize_name(&task.name);
        assert!(!sanitized.is_empty());
        assert_eq!(sanitized.chars().count(), task.name.trim().chars().count());
    }
}
