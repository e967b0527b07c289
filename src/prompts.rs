//! Prompt text for rubric generation, rubric and Likert judging, the GUI
//! agent and the feasibility judge.

use crate::judgment::{JudgeMode, RubricScope};
use crate::likert;
use crate::models::{ChatMessage, ContentPart, Role, TaskItem};
use crate::rubric::{Branch, RubricNode, RubricTree};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

/// Base64 payload for an inline PNG content part
pub fn encode_png(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

const RUBRIC_GENERATION: &str = r#"## TASK DESCRIPTION
You are an expert software quality assurance (QA) analyst. Your task is to take a user query for a web development project and generate a structured, hierarchical rubric. This rubric will be used to evaluate a generated webpage in a verifiable, binary (implemented/not implemented) manner.

The output must be a single JSON object with ```json and ``` wrapped around it.

The JSON object must have three top-level keys: `intention`, `static`, and `dynamic`.

### JSON Structure Rules:

1. Each node in the tree must be an object with two keys:
    - `description`: A string describing the feature or goal.
    - `children`: A list of child nodes, or null if it is a leaf node.

2. The `intention` section captures the high-level purpose and core goals of the webpage. Descriptions should be concise conceptual overviews of what the user wants to achieve.

3. The `static` section details all the non-interactive, visible elements of the webpage. Break components down into their smallest logical parts. For example, a "user profile card" becomes "user image", "username" and "user bio".

4. The `dynamic` section describes the interactive functionality of the page. It must have exactly two children:
    - `basic`: simple, single-step user actions such as typing into a text field, clicking a non-submitting button, or selecting a dropdown option.
    - `complex`: multi-step processes or actions that significantly change the application's state, such as submitting a form, fetching data, filtering a list, or navigating to a new view after an action.

5. Every leaf node (where "children" is null) must describe a specific, atomic and verifiable requirement that can be evaluated as "implemented" or "not implemented".

## Example

### User Query:
Design a book review submission form with fields for rating, author, and a text area.

### Generated Rubric Tree:
```json
{
    "intention": {
        "description": "The purpose of the web page.",
        "children": [
            {"description": "A web page for book reviews.", "children": null},
            {"description": "A form for submitting book reviews.", "children": null}
        ]
    },
    "static": {
        "description": "The static elements of the web page.",
        "children": [
            {
                "description": "The book review submission form.",
                "children": [
                    {"description": "A field to input the book's rating.", "children": null},
                    {"description": "A field to input the book's author.", "children": null},
                    {"description": "A text area for the review content.", "children": null}
                ]
            }
        ]
    },
    "dynamic": {
        "description": "The interaction between the user and the web page.",
        "children": [
            {
                "description": "Basic user interactions.",
                "children": [
                    {"description": "User can type text into the review text area.", "children": null}
                ]
            },
            {
                "description": "Complex user interactions.",
                "children": [
                    {"description": "User can submit the book review form.", "children": null}
                ]
            }
        ]
    }
}
```

## User Query
"#;

/// Ask for a rubric tree covering `user_query`
pub fn rubric_generation(user_query: &str) -> String {
    format!("{RUBRIC_GENERATION}{user_query}\n")
}

const TERMINOLOGY_NOTE: &str = "During your assessment, please note that the solution might use different terminology than the rubric. Consider a requirement met if the solution's feature is equivalent. For example, the required heading element is present on the webpage, though the exact text or symbol differs.";

const NEUTRALITY_NOTE: &str = "Avoid any position biases and ensure that the order in which the solutions were presented does not influence your decision. Do not allow the length of the solutions to influence your evaluation. Be as objective as possible.";

fn scope_focus(scope: RubricScope) -> &'static str {
    match scope {
        RubricScope::Combined => "a comprehensive rubric covering intention, static, and dynamic elements of the webpage",
        RubricScope::Intention => "a rubric focusing on the high-level intentions and goals of the webpage",
        RubricScope::Static => "a rubric focusing on the static elements of the webpage",
        RubricScope::Dynamic => "a rubric focusing on the dynamic and interactive elements of the webpage",
    }
}

fn branch_title(branch: Branch) -> &'static str {
    match branch {
        Branch::Intention => "Intention",
        Branch::Static => "Static Elements",
        Branch::Dynamic => "Dynamic Elements",
    }
}

fn leaf_instruction(mode: JudgeMode) -> &'static str {
    match mode {
        JudgeMode::Pointwise => "For each leaf node in the rubric (i.e., where \"children\" is null), you must add a new key \"value\" and assign it a boolean value: `true` if the requirement is met, and `false` otherwise.",
        JudgeMode::Pairwise => "For each leaf node in the rubric (i.e., where \"children\" is null), you must add a new key \"value\". The value must be a string: \"A\" if solution A is better, \"B\" if solution B is better, or \"tie\" if they are of equal quality or both fail to meet the requirement.",
    }
}

fn pretty(node: &RubricNode) -> String {
    serde_json::to_string_pretty(node).unwrap_or_default()
}

/// The user query, then one code block per candidate
fn push_query_and_code(text: &mut String, item: &TaskItem) {
    text.push_str(&format!("\n## User Query\n{}\n", item.user_query));
    match item.codes.as_slice() {
        [code] => text.push_str(&format!("\n## Code\n```tsx\n{code}\n```\n")),
        codes => {
            for (label, code) in ["A", "B"].iter().zip(codes) {
                text.push_str(&format!("\n## Code {label}\n```tsx\n{code}\n```\n"));
            }
        }
    }
}

/// Task description and the candidate code, everything before the images
fn judge_preamble(item: &TaskItem, scope: RubricScope, mode: JudgeMode, with_images: bool) -> String {
    let input_type = match (mode, with_images) {
        (JudgeMode::Pointwise, false) => "its code",
        (JudgeMode::Pointwise, true) => "its code and a screenshot of its initial state",
        (JudgeMode::Pairwise, false) => "their code",
        (JudgeMode::Pairwise, true) => "their code and screenshots of their initial states",
    };

    let mut text = match mode {
        JudgeMode::Pointwise => format!(
            "You are an expert Quality Assurance engineer specializing in web development. Your objective is to meticulously evaluate a web development task based on a predefined rubric. You will be provided with the user's initial query, the solution ({input_type}), and {}.\n\nBased on these inputs, you will assess whether each requirement in the rubric is implemented in the solution. {TERMINOLOGY_NOTE}\n",
            scope_focus(scope)
        ),
        JudgeMode::Pairwise => format!(
            "You are an expert Quality Assurance engineer specializing in web development. Your objective is to meticulously evaluate and compare two different web development solutions for the same task based on a predefined rubric. You will be provided with the user's initial query, two solutions ({input_type}), and {}.\n\nBased on these inputs, you will assess whether each requirement in the rubric is implemented in each of the two solutions. {NEUTRALITY_NOTE} {TERMINOLOGY_NOTE}\n",
            scope_focus(scope)
        ),
    };

    push_query_and_code(&mut text, item);
    text
}

/// Rubric section, leaf instructions and output format
fn judge_rubric_section(tree: &RubricTree, scope: RubricScope, mode: JudgeMode) -> String {
    let mut text = String::new();
    match scope {
        RubricScope::Combined => {
            text.push_str("## Rubric\n");
            for branch in Branch::ALL {
                text.push_str(&format!(
                    "### {}\n```json\n{}\n```\n\n",
                    branch_title(branch),
                    pretty(tree.branch(branch))
                ));
            }
            text.push_str(&format!(
                "## INSTRUCTIONS\nYour task is to return a single JSON object with three top-level keys: \"intention\", \"static\", and \"dynamic\". The value of each key must be a JSON object that mirrors the structure of the corresponding rubric above. {}\n",
                leaf_instruction(mode)
            ));
        }
        single => {
            let branch = single.branches()[0];
            text.push_str(&format!(
                "## Rubric: {}\n```json\n{}\n```\n\n",
                branch_title(branch),
                pretty(tree.branch(branch))
            ));
            text.push_str(&format!(
                "## INSTRUCTIONS\nYour task is to return a JSON object that mirrors the structure of the provided rubric. {}\n",
                leaf_instruction(mode)
            ));
        }
    }
    text.push_str("\n## Output Format\nBegin your evaluation by providing an explanation for your reasoning. End your output with a JSON object wrapped with ```json at the beginning and ``` at the end. Do not include any other text after the JSON object.\n");
    text
}

/// Build the judge conversation for one item.
///
/// `images` are base64 PNGs placed between the task text and the rubric.
pub fn build_judge_messages(
    item: &TaskItem,
    tree: &RubricTree,
    scope: RubricScope,
    mode: JudgeMode,
    images: &[String],
) -> Vec<ChatMessage> {
    let mut content = vec![ContentPart::Text {
        text: judge_preamble(item, scope, mode, !images.is_empty()),
    }];
    content.extend(images.iter().map(|data| ContentPart::PngImage { data: data.clone() }));
    content.push(ContentPart::Text {
        text: judge_rubric_section(tree, scope, mode),
    });
    vec![ChatMessage {
        role: Role::User,
        content,
    }]
}

// Likert baseline prompts

const LIKERT_CRITERIA: &str = r#"## Evaluation Criteria
1. Functional Correctness and Completeness
    - 1.1 **Core Functionality**: Are the primary features and requirements of the user query implemented and working as expected?
    - 1.2 **Content Accuracy and Completeness**: Is all required content (text, images, links) present, accurate and correctly placed?
    - 1.3 **Boundary Conditions and Corner Cases**: How does the solution behave with unexpected or extreme user inputs?
    - 1.4 **Error Handling**: Are errors handled gracefully, with clear messages and no crashes on invalid operations?

2. User Interface Quality
    - 2.1 **Visual Consistency and Cohesion**: Are colors, typography, spacing and component styling consistent across the page?
    - 2.2 **Layout, Structure, and Responsiveness**: Is the content well organised, and does the layout adapt to desktop, tablet and mobile screens?
    - 2.3 **Aesthetic Appeal**: Is the page visually engaging, with effective use of color, typography, imagery and whitespace?

3. Code Quality
    - 3.1 **Readability and Maintainability**: Is the code clearly organised, with consistent indentation and meaningful names?
    - 3.2 **Modularity and Reusability**: Is the code split into logical, reusable components without duplication?
    - 3.3 **Scalability and Efficiency**: Is the code efficient, and can it grow to support new features?

4. Interactivity
    - 4.1 **Effectiveness**: Do buttons, forms, menus and sliders work and give visual feedback on user actions?
    - 4.2 **Logical Correctness**: Does the application state change correctly in response to user interactions?
    - 4.3 **Accessibility**: Is it easy and intuitive to navigate the page and reach the user's goals?
"#;

fn likert_preamble(item: &TaskItem, mode: JudgeMode, with_images: bool) -> String {
    let input_type = match (mode, with_images) {
        (JudgeMode::Pointwise, false) => "code of the webpage",
        (JudgeMode::Pointwise, true) => "code of the webpage, and a screenshot of its initial state",
        (JudgeMode::Pairwise, false) => "codes for both webpages A and B",
        (JudgeMode::Pairwise, true) => "codes for both webpages A and B, and screenshots of their initial states",
    };
    let mut text = match mode {
        JudgeMode::Pointwise => format!(
            "You are an expert Quality Assurance engineer specializing in web development. Your objective is to meticulously evaluate a web development task. You will be provided with the user's initial query and the solution ({input_type}). Rate the solution on every sub-criterion below using a 5-point Likert scale, where 1 is \"Very Poor\" and 5 is \"Excellent\". Be as objective as possible.\n\n"
        ),
        JudgeMode::Pairwise => format!(
            "You are an expert Quality Assurance engineer specializing in web development. Your objective is to meticulously evaluate and compare two different web development solutions for the same task. You will be provided with the user's initial query and the solutions ({input_type}). Rate each solution on every sub-criterion below using a 5-point Likert scale, where 1 is \"Very Poor\" and 5 is \"Excellent\". {NEUTRALITY_NOTE}\n\n"
        ),
    };
    text.push_str(LIKERT_CRITERIA);
    push_query_and_code(&mut text, item);
    text
}

fn likert_output_format(mode: JudgeMode) -> String {
    let example: serde_json::Map<String, serde_json::Value> = likert::CRITERIA
        .iter()
        .map(|id| {
            let value = match mode {
                JudgeMode::Pointwise => serde_json::json!(4),
                JudgeMode::Pairwise => serde_json::json!({ "A": 4, "B": 3 }),
            };
            (id.to_string(), value)
        })
        .collect();
    let value_rule = match mode {
        JudgeMode::Pointwise => "assign a score from 1 to 5 as the value",
        JudgeMode::Pairwise => "use an object with the scores of each solution under the keys \"A\" and \"B\" as the value",
    };
    format!(
        "\n\n## Output Format\nBegin your evaluation by providing a short explanation. End your output with a json object wrapped with ```json at the beginning and ``` at the end. Use the sub-criterion id as the key and {value_rule}. Do not include any other text after the json object.\n\nHere is an example of the output format:\n```json\n{}\n```\n",
        serde_json::to_string_pretty(&example).unwrap_or_default()
    )
}

/// Build the Likert judge conversation for one item.
///
/// Each screenshot follows an `Initial State` heading for its candidate.
pub fn build_likert_messages(item: &TaskItem, mode: JudgeMode, images: &[String]) -> Vec<ChatMessage> {
    let mut content = vec![ContentPart::Text {
        text: likert_preamble(item, mode, !images.is_empty()),
    }];
    let titles = if images.len() == 1 {
        vec!["## Initial State"]
    } else {
        vec!["## Initial State A", "## Initial State B"]
    };
    for (title, data) in titles.iter().zip(images) {
        content.push(ContentPart::Text {
            text: format!("\n\n{title}\n"),
        });
        content.push(ContentPart::PngImage { data: data.clone() });
    }
    content.push(ContentPart::Text {
        text: likert_output_format(mode),
    });
    vec![ChatMessage {
        role: Role::User,
        content,
    }]
}

// GUI agent prompts

const AGENT_ACTION_SPACE: &str = r#"You are a GUI agent. You are given a task and your action history, with screenshots. You need to perform the next action to complete the task.

## Output Format
```
Thought: ...
Action: ...
```

## Action Space

click(point='<point>x1 y1</point>')
left_double(point='<point>x1 y1</point>')
right_single(point='<point>x1 y1</point>')
drag(start_point='<point>x1 y1</point>', end_point='<point>x2 y2</point>')
hotkey(key='ctrl c') # Split keys with a space and use lowercase. Also, do not use more than 3 keys in one hotkey action.
type(content='xxx') # Use escape characters \', \", and \n in content part to ensure we can parse the content in normal python string format. If you want to submit your input, use \n at the end of content.
scroll(point='<point>x1 y1</point>', direction='down or up or right or left') # Show more information on the `direction` side.
wait() # Sleep for 5s and take a screenshot to check for any changes.
finished(content='xxx') # Use escape characters \', \", and \n in content part to ensure we can parse the content in normal python string format.

"#;

const UPLOAD_NOTE: &str = "- If the task involves file uploads, you can only upload the 'sample_1.png', 'sample_2.png', 'sample.xlsx' or 'sample.pdf' files. Do not enter any other directories.\n";

const INFEASIBLE_NOTE: &str = "- If you think the task is infeasible, your action should be `finished` and the content should be `failed` without any other content.\n";

/// Opening user prompt of an agent session
pub fn agent_system_prompt(infeasible_exit: bool, language: &str, instruction: &str) -> String {
    let mut text = String::from(AGENT_ACTION_SPACE);
    text.push_str("## Note\n");
    text.push_str(&format!("- Use {language} in `Thought` part.\n"));
    text.push_str("- Write a small plan and finally summarize your next action (with its target element) in one sentence in `Thought` part.\n");
    if infeasible_exit {
        text.push_str(INFEASIBLE_NOTE);
    }
    text.push_str(UPLOAD_NOTE);
    text.push_str(&format!("\n## User Instruction\n{instruction}\n"));
    text
}

/// Instruction of a static task: find the listed element ids
pub fn static_checking(static_elements: &str) -> String {
    format!(
        "Please check the given web page for a specific set of elements. Some elements may require an action to become accessible. Please perform necessary actions. Please note that the elements might use different terminology. Consider an element found if the feature is equivalent. For example, the required heading element is present on the webpage, though the exact text or symbol differs.\n\n**Elements to Check:**\nThe elements are listed with their ID and a brief description. After checking, your action should be `finished` and the content should be the element IDs you have found.\n\n{static_elements}\n"
    )
}

/// Instruction of an intention task
pub fn intention_checking(intention: &str) -> String {
    format!(
        "Please determine if the given web page can fulfill or demonstrate the purpose. You are allowed to interact with the page, such as clicking buttons, filling forms, or navigating, to see if the purpose can be met or demonstrated.\n\n**Purpose to Check:**\n{intention}\n\nAfter your evaluation, your action should be `finished`. If the webpage demonstrates or fulfills the purpose, the content should be `success`. Otherwise, the content should be `failed` without any other content.\n"
    )
}

pub const FINISH_NOW_STATIC: &str = "You have reached the maximum number of steps. Your next action should be `finished` and the content should contain the IDs of the elements you have found.";

pub const FINISH_NOW_DYNAMIC: &str = "You have reached the maximum number of steps. Your next action should be `finished` and the content should be `success` if you think the task can be completed in another few steps. Otherwise, the content should be `failed`.";

pub const FINISH_NOW_INTENTION: &str = "You have reached the maximum number of steps. Your next action should be `finished` and the content should be `success` if you think the purpose is demonstrated or fulfilled. Otherwise, the content should be `failed`.";

/// Ask whether `task` can reach `expected` on the page in `html_code`
pub fn feasibility(html_code: &str, task: &str, expected: &str) -> String {
    format!(
        "You are an expert web developer. Your task is to determine if a given web development task is feasible based on the provided HTML code.\n\n**HTML Code:**\n```html\n{html_code}\n```\n\n**Task Description:**\n{task}\n\n**Expected Result:**\n{expected}\n\nBased on the code, can the task be completed to achieve the expected result? The result is only achievable if all elements required for the interaction are present in the HTML.\n\nPlease begin your response with the analysis. Then provide your answer in the following JSON format.\n\n```json\n{{\n  \"feasible\": <true or false>\n}}\n```\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rubric::tests::sample_tree;
    use crate::scoring::Verdict;

    fn pair_item() -> TaskItem {
        TaskItem {
            question_id: "q1".to_string(),
            user_query: "Build a book review site".to_string(),
            candidate: None,
            codes: vec!["<A/>".to_string(), "<B/>".to_string()],
            screenshots: Vec::new(),
            label: Verdict::Tie,
        }
    }

    #[test]
    fn test_pairwise_prompt_labels_both_solutions() {
        let messages = build_judge_messages(&pair_item(), &sample_tree(), RubricScope::Static, JudgeMode::Pairwise, &[]);
        assert_eq!(messages.len(), 1);
        let text = messages[0].joined_text();
        assert!(text.contains("## Code A\n```tsx\n<A/>"));
        assert!(text.contains("## Code B\n```tsx\n<B/>"));
        assert!(text.contains("## Rubric: Static Elements"));
        assert!(text.contains("\"tie\""));
        assert!(!text.contains("### Intention"));
    }

    #[test]
    fn test_likert_pair_prompt_with_screenshots() {
        let images = vec!["QUFB".to_string(), "QkJC".to_string()];
        let messages = build_likert_messages(&pair_item(), JudgeMode::Pairwise, &images);
        let content = &messages[0].content;
        assert_eq!(messages[0].image_count(), 2);
        assert!(matches!(&content[1], ContentPart::Text { text } if text.contains("## Initial State A")));
        assert_eq!(content[2], ContentPart::PngImage { data: "QUFB".to_string() });
        assert!(matches!(&content[3], ContentPart::Text { text } if text.contains("## Initial State B")));

        let text = messages[0].joined_text();
        assert!(text.contains("screenshots of their initial states"));
        assert!(text.contains("## Code B\n```tsx\n<B/>"));
        assert!(text.contains("4.3 **Accessibility**"));
        assert!(text.contains("\"A\": 4"));
    }

    #[test]
    fn test_likert_single_prompt_without_screenshots() {
        let mut item = pair_item();
        item.codes.truncate(1);
        let messages = build_likert_messages(&item, JudgeMode::Pointwise, &[]);
        let text = messages[0].joined_text();
        assert_eq!(messages[0].image_count(), 0);
        assert!(text.contains("(code of the webpage)"));
        assert!(!text.contains("Initial State"));
        assert!(text.contains("\"4.3\": 4"));
    }

    #[test]
    fn test_combined_pointwise_prompt_lists_every_branch() {
        let mut item = pair_item();
        item.codes.truncate(1);
        let messages = build_judge_messages(&item, &sample_tree(), RubricScope::Combined, JudgeMode::Pointwise, &[]);
        let text = messages[0].joined_text();
        assert!(text.contains("## Code\n```tsx\n<A/>"));
        for title in ["### Intention", "### Static Elements", "### Dynamic Elements"] {
            assert!(text.contains(title), "missing {title}");
        }
        assert!(text.contains("boolean value"));
    }

    #[test]
    fn test_images_sit_between_task_and_rubric() {
        let images = vec!["AAAA".to_string(), "BBBB".to_string()];
        let messages = build_judge_messages(&pair_item(), &sample_tree(), RubricScope::Intention, JudgeMode::Pairwise, &images);
        let content = &messages[0].content;
        assert_eq!(content.len(), 4);
        assert!(matches!(&content[0], ContentPart::Text { text } if text.contains("screenshots")));
        assert_eq!(content[1], ContentPart::PngImage { data: "AAAA".to_string() });
        assert!(matches!(&content[3], ContentPart::Text { text } if text.starts_with("## Rubric: Intention")));
    }

    #[test]
    fn test_agent_prompt_variants() {
        let dynamic = agent_system_prompt(true, "English", "Click the submit button.");
        assert!(dynamic.contains("Use English in `Thought`"));
        assert!(dynamic.contains("infeasible"));
        assert!(dynamic.ends_with("## User Instruction\nClick the submit button.\n"));
        let static_ = agent_system_prompt(false, "English", "x");
        assert!(!static_.contains("infeasible"));
    }

    #[test]
    fn test_feasibility_prompt_embeds_inputs() {
        let text = feasibility("<p>hi</p>", "Click hi", "Nothing happens");
        assert!(text.contains("```html\n<p>hi</p>\n```"));
        assert!(text.contains("\"feasible\": <true or false>"));
    }

    #[test]
    fn test_encode_png() {
        assert_eq!(encode_png(b"png"), "cG5n");
    }
}
