use std::path::Path;

use anyhow::{bail, Context, Result};
use container_builder::{build_image, load_recipe, preflight, report, Buildah, ImageRecipe};

fn usage() -> &'static str {
    "Usage:\n  container-builder build [recipe.toml]\n  container-builder check [recipe.toml]\n  container-builder runs [recipe.toml]\n  container-builder recipe show [recipe.toml]"
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd] if cmd == "build" => build(None),
        [cmd, recipe] if cmd == "build" => build(Some(Path::new(recipe))),
        [cmd] if cmd == "check" => check(None),
        [cmd, recipe] if cmd == "check" => check(Some(Path::new(recipe))),
        [cmd] if cmd == "runs" => list_runs(None),
        [cmd, recipe] if cmd == "runs" => list_runs(Some(Path::new(recipe))),
        [recipe_cmd, show] if recipe_cmd == "recipe" && show == "show" => show_recipe(None),
        [recipe_cmd, show, recipe] if recipe_cmd == "recipe" && show == "show" => {
            show_recipe(Some(Path::new(recipe)))
        }
        _ => bail!(usage()),
    }
}

fn resolve_recipe(path: Option<&Path>) -> Result<ImageRecipe> {
    match path {
        Some(path) => {
            load_recipe(path).with_context(|| format!("loading recipe '{}'", path.display()))
        }
        None => Ok(ImageRecipe::default()),
    }
}

fn build(path: Option<&Path>) -> Result<()> {
    let recipe = resolve_recipe(path)?;
    preflight::check_host_tools()?;

    let engine = Buildah::new();
    let summary = build_image(&engine, &recipe)?;

    println!(
        "[build] image '{}' ({}) ready; run manifest {}",
        summary.image_name, summary.image_id, summary.run_id
    );
    Ok(())
}

fn check(path: Option<&Path>) -> Result<()> {
    let recipe = resolve_recipe(path)?;
    preflight::check_host_tools()?;

    println!(
        "[check] recipe ok: image '{}' from '{}' with {} artifact(s); host tools ok",
        recipe.image_name,
        recipe.base_image,
        recipe.artifacts.len()
    );
    Ok(())
}

fn list_runs(path: Option<&Path>) -> Result<()> {
    let recipe = resolve_recipe(path)?;
    let image_root = report::image_state_dir(&recipe.build.state_dir, &recipe.image_name);

    let mut runs = report::load_runs(&image_root)?;
    if runs.is_empty() {
        println!("[runs] no recorded builds for '{}'", recipe.image_name);
        return Ok(());
    }
    // Run ids are timestamp-prefixed, so this is newest-first.
    runs.sort_by(|a, b| b.run_id.cmp(&a.run_id));

    for run in runs {
        println!(
            "{}  {:7}  {}",
            run.run_id,
            run.status,
            run.image_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn show_recipe(path: Option<&Path>) -> Result<()> {
    let recipe = resolve_recipe(path)?;
    print!("{}", recipe.to_toml()?);
    Ok(())
}
