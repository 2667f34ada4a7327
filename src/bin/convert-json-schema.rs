use tokenrail::json_schema::regex_from_str;

fn main() {
    let schema = std::io::read_to_string(std::io::stdin()).expect("reading schema from stdin");
    match regex_from_str(&schema, None, None) {
        Ok(regex) => {
            println!("Regex: {}", regex);
            println!("Regex len: {}", regex.len());
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
