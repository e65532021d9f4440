use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nativefm-host")]
#[command(version)]
#[command(
    about = "Native messaging host exposing an on-device language model to browser extensions",
    long_about = None
)]
pub struct Cli {
    /// 호출한 확장 프로그램의 origin (브라우저가 전달, 예: chrome-extension://<id>/)
    pub origin: Option<String>,

    /// Windows Chrome이 전달하는 부모 창 핸들
    #[arg(long, value_name = "HWND")]
    pub parent_window: Option<String>,

    /// 설정 파일 경로. 미지정시 ~/.nativefm/config.toml
    #[arg(short = 'c', long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// 백엔드 선택 (echo, command). 미지정시 설정 파일의 backend 사용
    #[arg(short = 'b', long)]
    pub backend: Option<String>,

    /// 디버그 모드 (debug 로그 강제)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// 백엔드 상태만 확인하고 종료 (프로토콜 미사용)
    #[arg(long)]
    pub check: bool,
}
