use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 版本信息附带构建时间和提交号；不在 git 仓库中时 vergen 只给出告警
    EmitBuilder::builder()
        .build_timestamp()
        .git_sha(true)
        .emit()?;
    Ok(())
}
