/// Fixed substitution table applied during tag expansion. First hit wins;
/// order within each entry is preserved in the output.
const TAG_ALIASES: &[(&str, &[&str])] = &[
    ("js", &["javascript"]),
    ("ts", &["typescript"]),
    ("py", &["python"]),
    ("rb", &["ruby"]),
    ("rs", &["rust"]),
    ("go", &["golang"]),
    ("cpp", &["c++"]),
    ("cs", &["csharp", "c#"]),
    ("kt", &["kotlin"]),
    ("sh", &["shell", "bash"]),
    ("react", &["jsx", "tsx"]),
    ("vue", &["vuejs"]),
    ("node", &["nodejs"]),
    ("k8s", &["kubernetes"]),
    ("db", &["database", "sql"]),
];

/// Expands a tag into its search variants: the tag itself, its lower- and
/// upper-case forms, plus any fixed aliases. Deduplicated, insertion order
/// preserved; never reordered.
pub fn expand_tag(tag: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |candidate: String| {
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    };

    push(tag.to_string());
    push(tag.to_lowercase());
    push(tag.to_uppercase());

    let lowered = tag.to_lowercase();
    if let Some((_, aliases)) = TAG_ALIASES.iter().find(|(key, _)| *key == lowered) {
        for alias in *aliases {
            push((*alias).to_string());
        }
    }

    out
}

/// Expands every tag in order, deduplicating across the whole set.
pub fn expand_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        for variant in expand_tag(tag) {
            if !out.contains(&variant) {
                out.push(variant);
            }
        }
    }
    out
}
