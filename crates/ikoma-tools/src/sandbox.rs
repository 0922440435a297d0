use regex::RegexBuilder;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// The `filename|||content` convention the plan JSON uses for file tools.
pub fn split_filename_and_content(raw: &str) -> Result<(String, String), String> {
    let Some((filename, content)) = raw.split_once("|||") else {
        return Err("Use format 'filename|||content'".to_string());
    };
    let mut filename = filename.trim().to_string();
    if !filename.ends_with(".txt") {
        filename.push_str(".txt");
    }
    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        return Err(format!("Filename '{filename}' must stay inside the sandbox"));
    }
    Ok((filename, content.to_string()))
}

pub fn list_files(sandbox: &Path) -> Result<String, String> {
    fs::create_dir_all(sandbox).map_err(|e| format!("Error listing files: {e}"))?;
    let mut entries: Vec<(String, u64)> = fs::read_dir(sandbox)
        .map_err(|e| format!("Error listing files: {e}"))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .map(|entry| {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            (entry.file_name().to_string_lossy().to_string(), size)
        })
        .collect();
    if entries.is_empty() {
        return Ok("Sandbox directory is empty. Create some files to get started!".to_string());
    }
    entries.sort();
    let lines: Vec<String> = entries
        .iter()
        .map(|(name, size)| format!("- {name} ({size} bytes)"))
        .collect();
    Ok(format!("Files in sandbox:\n{}", lines.join("\n")))
}

pub fn create_file(sandbox: &Path, filename_and_content: &str) -> Result<String, String> {
    fs::create_dir_all(sandbox).map_err(|e| format!("Error creating file: {e}"))?;
    let (filename, content) = split_filename_and_content(filename_and_content)?;
    let path = sandbox.join(&filename);
    if path.exists() {
        return Err(format!(
            "File '{filename}' already exists. Use update_text_file."
        ));
    }
    fs::write(&path, content).map_err(|e| format!("Error creating file: {e}"))?;
    Ok(format!("✓ Created file: {filename}"))
}

pub fn update_file(sandbox: &Path, filename_and_content: &str) -> Result<String, String> {
    fs::create_dir_all(sandbox).map_err(|e| format!("Error updating file: {e}"))?;
    let (filename, content) = split_filename_and_content(filename_and_content)?;
    let path = sandbox.join(&filename);
    if !path.exists() {
        return Err(format!(
            "File '{filename}' not found. Use create_text_file to create new files."
        ));
    }
    fs::write(&path, content).map_err(|e| format!("Error updating file: {e}"))?;
    Ok(format!("✓ Updated file: {filename}"))
}

pub fn read_file(sandbox: &Path, filename: &str) -> Result<String, String> {
    fs::create_dir_all(sandbox).map_err(|e| format!("Error reading file: {e}"))?;
    let filename = filename.trim();
    if filename.is_empty() {
        let names = existing_names(sandbox);
        return Ok(if names.is_empty() {
            "No files in sandbox.".to_string()
        } else {
            format!("Available files: {}", names.join(", "))
        });
    }
    let mut filename = filename.to_string();
    if !filename.ends_with(".txt") {
        filename.push_str(".txt");
    }
    let path = sandbox.join(&filename);
    if !path.exists() {
        let names = existing_names(sandbox);
        let available = if names.is_empty() {
            "none".to_string()
        } else {
            names.join(", ")
        };
        return Err(format!("File '{filename}' not found. Available: {available}"));
    }
    fs::read_to_string(&path).map_err(|e| format!("Error reading file: {e}"))
}

pub fn scan_files(sandbox: &Path, pattern: &str, file_extension: &str) -> Result<String, String> {
    fs::create_dir_all(sandbox).map_err(|e| format!("Error scanning sandbox: {e}"))?;
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| format!("Invalid pattern '{pattern}': {e}"))?;
    let extensions: Vec<String> = file_extension
        .split(',')
        .map(|ext| ext.trim().to_string())
        .filter(|ext| !ext.is_empty())
        .collect();

    let mut report = Vec::new();
    for entry in WalkDir::new(sandbox)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if !extensions.iter().any(|ext| name.ends_with(ext.as_str())) {
            continue;
        }
        let Ok(content) = fs::read_to_string(entry.path()) else {
            continue;
        };
        let mut matches = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                matches.push(format!("  Line {}: {}", idx + 1, line.trim()));
            }
        }
        if !matches.is_empty() {
            let rel = entry
                .path()
                .strip_prefix(sandbox)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            report.push(format!("{rel}:"));
            report.extend(matches);
        }
    }

    if report.is_empty() {
        return Ok(format!(
            "No {pattern} matches found in sandbox {file_extension} files."
        ));
    }
    Ok(format!("Matches found in sandbox:\n{}", report.join("\n")))
}

fn existing_names(sandbox: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(sandbox)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_file())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = create_file(dir.path(), "test.txt|||benchmark").expect("create");
        assert!(out.contains("Created file: test.txt"));
        assert_eq!(read_file(dir.path(), "test.txt").expect("read"), "benchmark");
        assert_eq!(
            fs::read_to_string(dir.path().join("test.txt")).expect("bytes"),
            "benchmark"
        );
    }

    #[test]
    fn create_refuses_to_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        create_file(dir.path(), "a.txt|||one").expect("create");
        let err = create_file(dir.path(), "a.txt|||two").expect_err("duplicate");
        assert!(err.contains("already exists"));
        // update_text_file is the overwrite path.
        update_file(dir.path(), "a.txt|||two").expect("update");
        assert_eq!(read_file(dir.path(), "a.txt").expect("read"), "two");
    }

    #[test]
    fn txt_extension_is_appended_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        create_file(dir.path(), "notes|||hello").expect("create");
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn filenames_cannot_escape_the_sandbox() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(create_file(dir.path(), "../evil.txt|||x").is_err());
        assert!(create_file(dir.path(), "sub/dir.txt|||x").is_err());
    }

    #[test]
    fn listing_reports_names_and_sizes() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(list_files(dir.path()).expect("empty").contains("empty"));
        create_file(dir.path(), "data.txt|||12345").expect("create");
        let listing = list_files(dir.path()).expect("list");
        assert!(listing.contains("data.txt (5 bytes)"));
    }

    #[test]
    fn read_with_empty_filename_lists_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        create_file(dir.path(), "one.txt|||x").expect("create");
        let out = read_file(dir.path(), "").expect("read");
        assert!(out.contains("Available files: one.txt"));
    }

    #[test]
    fn scan_reports_matching_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        create_file(dir.path(), "todo.txt|||first line\nTODO: fix this\nlast").expect("create");
        let out = scan_files(dir.path(), "TODO|FIXME", ".py,.md,.txt").expect("scan");
        assert!(out.contains("todo.txt"));
        assert!(out.contains("Line 2: TODO: fix this"));

        let none = scan_files(dir.path(), "NOPE", ".txt").expect("scan");
        assert!(none.contains("No NOPE matches"));
    }
}
