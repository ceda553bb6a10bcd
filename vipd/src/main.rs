fn main() {
    vipd_cmd::run()
}
