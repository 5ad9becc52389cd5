use anyhow::Result;
use integration_tests::support::Workspace;

#[tokio::test]
async fn console_mutations_show_up_in_state() -> Result<()> {
    let workspace = Workspace::new().await?;
    let console = workspace.console()?;

    console.execute("mkdir build/out").await?;
    console.execute("cd build").await?;
    console.execute("touch out/log.txt").await?;

    let state = workspace.fs.state().current().await;
    assert!(state.contains_folder("build"));
    assert!(state.contains_folder("build/out"));
    assert!(state.contains_file("build/out/log.txt"));

    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn shell_output_and_external_changes() -> Result<()> {
    let workspace = Workspace::new().await?;
    let console = workspace.console()?;

    console.execute("mkdir scripts").await?;
    console.execute("cd scripts").await?;
    let response = console
        .execute("printf 'ready' && printf 'x' > generated.txt")
        .await?;
    assert_eq!(response.result, "ready");
    assert_eq!(response.cwd, "scripts");

    // Files made by the real shell are only known after a rescan.
    assert!(!workspace
        .fs
        .state()
        .current()
        .await
        .contains_file("scripts/generated.txt"));
    let state = workspace.fs.state().full_rescan().await?;
    assert!(state.contains_file("scripts/generated.txt"));

    Ok(())
}
