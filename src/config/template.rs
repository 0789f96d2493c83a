use anyhow::{bail, Context as _, Result};
use documented::{Documented, DocumentedFields};
use toml_edit::{Decor, DocumentMut, Item, RawString, Table};

use super::{AccountConfig, BuildConfig, ImageConfig};

/// Render a config as TOML with the doc comments of every field written above it.
pub fn annotated_toml(config: &BuildConfig) -> Result<DocumentMut> {
    let mut doc = toml_edit::ser::to_string_pretty(config)?.parse::<DocumentMut>()?;

    annotate_fields::<BuildConfig>(doc.as_table_mut()).context("Failed to annotate `BuildConfig`")?;

    if let Some(table) = doc.get_mut("image").and_then(Item::as_table_mut) {
        annotate_fields::<ImageConfig>(table).context("Failed to annotate `ImageConfig`")?;
    }
    if let Some(table) = doc.get_mut("account").and_then(Item::as_table_mut) {
        annotate_fields::<AccountConfig>(table).context("Failed to annotate `AccountConfig`")?;
    }

    Ok(doc)
}

/// The annotated config preceded by the documentation of [`BuildConfig`] itself.
pub fn render_template(config: &BuildConfig) -> Result<String> {
    let header: String = BuildConfig::DOCS
        .lines()
        .map(|line| format!("# {line}").trim_end().to_owned() + "\n")
        .collect();
    Ok(format!("{header}\n{}", annotated_toml(config)?))
}

fn prepend_comment(decor: &mut Decor, docs: &str) {
    let comment: String = docs
        .lines()
        .map(|line| match line {
            "" => "#\n".to_owned(),
            line => format!("# {line}\n"),
        })
        .collect();

    let existing = decor
        .prefix()
        .and_then(RawString::as_str)
        .unwrap_or_default()
        .to_owned();

    let prefix = if existing.trim().is_empty() {
        comment
    } else if existing.ends_with("#\n") {
        format!("{existing}{comment}")
    } else {
        format!("{existing}#\n{comment}")
    };
    decor.set_prefix(prefix);
}

/// Only the direct keys of `table` are annotated; sub-tables get the doc of their field here and
/// are annotated on their own by the caller.
fn annotate_fields<T: DocumentedFields>(table: &mut Table) -> Result<()> {
    for (mut key, value) in table.iter_mut() {
        let Ok(docs) = T::get_field_docs(key.get()) else {
            continue;
        };

        match value {
            Item::None => bail!("Unexpected empty item for key {:?}", key.get()),
            Item::Value(_) => prepend_comment(key.leaf_decor_mut(), docs),
            Item::Table(sub_table) => prepend_comment(sub_table.decor_mut(), docs),
            Item::ArrayOfTables(array) => {
                if let Some(first) = array.iter_mut().next() {
                    prepend_comment(first.decor_mut(), docs);
                }
            }
        }
    }
    Ok(())
}
